use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::{actions::Request, config::Config};

/// The command line interface for the serial bridge agent.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// Override the port part of the configured listen address
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,

    /// Show an example JSON request for opening a port.
    OpenPort,

    /// Show an example JSON request for writing bytes to a port.
    Write,

    /// Show an example JSON request for streaming a port.
    StreamRead,

    /// Show an example JSON chunk of a write stream.
    Chunk,
}

/// Print the requested example.
pub fn handle_command(command: Commands) {
    let Commands::Examples(example) = command;

    let output = match example {
        Examples::Config => Config::example().serialize_pretty(),
        Examples::OpenPort => Request::example_open_port().serialize(),
        Examples::Write => Request::example_write().serialize(),
        Examples::StreamRead => Request::example_stream_read().serialize(),
        Examples::Chunk => Request::example_chunk().serialize(),
    };

    println!("{output}");
}
