//! Implementation of the `completions` command.

use std::io;

use clap::Command;
use clap::Parser;
use clap_complete::Shell;
use clap_complete::generate;

/// Arguments for the `completions` command.
#[derive(Parser, Debug)]
pub struct Args {
    /// The shell to generate completions for.
    #[arg(value_enum)]
    shell: Shell,
}

/// The main function for the `completions` command.
pub fn completions(args: Args, cmd: &mut Command) {
    eprintln!("generating completion file for {:?}", args.shell);
    let name = cmd.get_name().to_string();
    generate(args.shell, cmd, name, &mut io::stdout());
}
