use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "cpacfstatsd")]
#[command(version)]
#[command(about = "Daemon to provide access to CPACF crypto activity counters", long_about = None)]
pub(crate) struct Cli {
    /// Run in foreground and log to stderr instead of detaching
    #[arg(short, long)]
    pub foreground: bool,
}
