mod cli;
mod core;
mod interfaces;
mod logging;
#[cfg(test)]
mod test_support;

use crate::core::terminal;

#[tokio::main]
async fn main() {
    match cli::run_main().await {
        Ok(()) => {}
        Err(e) => {
            terminal::print_error(&format!("{:#}", e));
            std::process::exit(1);
        }
    }
}
