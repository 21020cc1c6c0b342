//! variant-call
#![deny(missing_docs)]

use clap::Parser;
use std::process::ExitCode;
use vc_wrap::{print_error_chain, run, Args};

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(outputs) => {
            println!("{}\t{}", outputs.final_artifact, outputs.size);
            ExitCode::SUCCESS
        }
        Err(err) => {
            print_error_chain(&err);
            ExitCode::FAILURE
        }
    }
}
