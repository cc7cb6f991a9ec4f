use anyhow::Result;
use qram::cli;

fn main() -> Result<()> {
    cli::handle_calls()
}
