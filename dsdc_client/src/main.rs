//! DSDC interactive client executable.

use std::process::ExitCode;

use clap::Parser;
use dsdc::{
    logger_init, parse_host_port, pf_error, ClientConfig, DsdcClient,
    DsdcError, ME,
};
use log::{self, LevelFilter};
use tokio::runtime::Builder;

mod repl;

use crate::repl::ClientRepl;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Master addresses as 'host:port', repeatable.
    #[arg(short, long, required = true)]
    master: Vec<String>,

    /// Client configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Route all operations through the masters instead of directly to
    /// the owning nodes.
    #[arg(long, default_value_t = false)]
    safe: bool,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok((config, masters))` on
    /// success or `Err(DsdcError)` on any error.
    fn sanitize(
        &self,
    ) -> Result<(ClientConfig, Vec<(String, u16)>), DsdcError> {
        if self.threads < 2 {
            return Err(DsdcError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }
        let masters = self
            .master
            .iter()
            .map(|addr| parse_host_port(addr))
            .collect::<Result<Vec<_>, _>>()?;
        let config_str = if self.config.is_empty() {
            None
        } else {
            Some(self.config.replace('+', "\n"))
        };
        Ok((ClientConfig::parsed(config_str.as_deref())?, masters))
    }
}

/// Actual main function of the DSDC client.
fn client_main() -> Result<(), DsdcError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let (config, masters) = args.sanitize()?;
    let _ = ME.set("c".into());

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-client")
            .build()?;

        // enter tokio runtime, set up the smart client, and start the
        // REPL loop
        runtime.block_on(async move {
            let cli = DsdcClient::new(masters, config)?;
            let mut repl = ClientRepl::new(cli, args.safe);

            repl.run().await?;

            // suppress logging before dropping the runtime to avoid
            // spurious error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), DsdcError>(())
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the DSDC client.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
