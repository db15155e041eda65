//! DSDC data slave executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use dsdc::{
    logger_init, parse_host_port, pf_error, DsdcError, Slave, SlaveConfig,
    ME,
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
    #[arg(short, long, default_value_t = 41000)]
    port: u16,

    /// Master addresses as 'host:port', repeatable.
    #[arg(short, long, required = true)]
    master: Vec<String>,

    /// Slave configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 16)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok((config, masters))` on
    /// success or `Err(DsdcError)` on any error.
    fn sanitize(
        &self,
    ) -> Result<(SlaveConfig, Vec<(String, u16)>), DsdcError> {
        if self.port <= 1024 {
            return Err(DsdcError::msg(format!(
                "invalid port {}",
                self.port
            )));
        }
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
        Ok((SlaveConfig::parsed(config_str.as_deref())?, masters))
    }
}

/// Actual main function of the DSDC data slave.
fn slave_main() -> Result<(), DsdcError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let (config, masters) = args.sanitize()?;

    let addr: SocketAddr = format!("{}:{}", args.bind_ip, args.port)
        .parse()
        .map_err(|e| {
            DsdcError::msg(format!(
                "failed to parse addr: bind_ip {} port {}: {}",
                args.bind_ip, args.port, e
            ))
        })?;
    let _ = ME.set(format!("s:{}", args.port));

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
            .thread_name("tokio-worker-slave")
            .build()?;

        // enter tokio runtime, set up the slave, and start the main event
        // loop logic
        runtime.block_on(async move {
            let mut slave =
                Slave::new_and_setup(addr, masters, config).await?;

            slave.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid
            // spurious error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), DsdcError>(())
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the DSDC data slave.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = slave_main() {
        pf_error!("slave_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    #[test]
    fn sanitize_valid() -> Result<(), DsdcError> {
        let args = CliArgs {
            bind_ip: "127.0.0.1".parse()?,
            port: 41000,
            master: vec!["10.0.0.1:40100".into(), "10.0.0.2:40100".into()],
            config: "nnodes = 8".into(),
            threads: 2,
        };
        let (config, masters) = args.sanitize()?;
        assert_eq!(config.nnodes, 8);
        assert_eq!(masters.len(), 2);
        assert_eq!(masters[0], ("10.0.0.1".into(), 40100));
        Ok(())
    }

    #[test]
    fn sanitize_invalid_port() -> Result<(), DsdcError> {
        let args = CliArgs {
            bind_ip: "127.0.0.1".parse()?,
            port: 80,
            master: vec!["10.0.0.1:40100".into()],
            config: "".into(),
            threads: 2,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_master_addr() -> Result<(), DsdcError> {
        let args = CliArgs {
            bind_ip: "127.0.0.1".parse()?,
            port: 41000,
            master: vec!["not-an-addr".into()],
            config: "".into(),
            threads: 2,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }
}
