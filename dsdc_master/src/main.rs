//! DSDC master (membership oracle) executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use dsdc::{
    logger_init, pf_error, DsdcError, Master, MasterConfig, ME,
};
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening socket.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Port to listen on.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 40100)]
    port: u16,

    /// Master configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 16)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(config)` on success or
    /// `Err(DsdcError)` on any error.
    fn sanitize(&self) -> Result<MasterConfig, DsdcError> {
        if self.port <= 1024 {
            Err(DsdcError::msg(format!("invalid port {}", self.port)))
        } else if self.threads < 2 {
            Err(DsdcError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            let config_str = if self.config.is_empty() {
                None
            } else {
                Some(self.config.replace('+', "\n"))
            };
            MasterConfig::parsed(config_str.as_deref())
        }
    }
}

/// Actual main function of the DSDC master.
fn master_main() -> Result<(), DsdcError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let config = args.sanitize()?;

    let addr: SocketAddr = format!("{}:{}", args.bind_ip, args.port)
        .parse()
        .map_err(|e| {
            DsdcError::msg(format!(
                "failed to parse addr: bind_ip {} port {}: {}",
                args.bind_ip, args.port, e
            ))
        })?;
    let _ = ME.set(format!("M:{}", args.port));

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-master")
            .build()?;

        // enter tokio runtime, set up the master, and start the main
        // event loop logic
        runtime.block_on(async move {
            let mut master = Master::new_and_setup(addr, config).await?;

            master.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid
            // spurious error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), DsdcError>(())
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the DSDC master.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = master_main() {
        pf_error!("master_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
