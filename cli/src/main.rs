//! edgeupd command-line entry point.
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

use anyhow::Result;
use edgeupd_lib::cli::StatusCode;

fn run() -> Result<StatusCode> {
    edgeupd_lib::cli::run_from_iter(std::env::args())
}

fn main() {
    let code = match run() {
        Ok(code) => code as i32,
        Err(e) => {
            eprintln!("error: {:#}", e);
            StatusCode::UnknownError as i32
        }
    };
    std::process::exit(code);
}
