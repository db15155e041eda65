//! Interactive REPL-style command-line interface over the smart client.

use std::io::{self, Write};
use std::str::SplitWhitespace;

use color_print::{cprint, cprintln};
use dsdc::{DsdcClient, DsdcError, HolderId, Key, Status};

/// Prompt string at the start of line.
const PROMPT: &str = ">>>>> ";

/// Recognizable command types.
enum ReplCommand {
    /// Look up one object.
    Get(Key),

    /// Look up many objects in one go.
    MGet(Vec<Key>),

    /// Insert or replace one object.
    Put {
        key: Key,
        value: Vec<u8>,
        annotation: Option<String>,
    },

    /// Remove one object.
    Remove(Key),

    /// Acquire an advisory lock.
    Lock { key: Key, writer: bool, block: bool },

    /// Release a lock hold.
    Release { key: Key, holder: HolderId },

    /// Force a membership snapshot refresh.
    Refresh,

    /// Print help message.
    PrintHelp,

    /// Client exit.
    Exit,

    /// Nothing read.
    Nothing,
}

/// Interactive REPL-style client struct.
pub(crate) struct ClientRepl {
    /// The underlying smart client.
    cli: DsdcClient,

    /// Route all operations through the masters instead of directly.
    safe: bool,

    /// User input buffer.
    input_buf: String,
}

impl ClientRepl {
    pub(crate) fn new(cli: DsdcClient, safe: bool) -> Self {
        ClientRepl {
            cli,
            safe,
            input_buf: String::new(),
        }
    }

    /// Prints the prompt string.
    fn print_prompt() {
        cprint!("<bright-yellow>{}</>", PROMPT);
        io::stdout().flush().unwrap();
    }

    /// Prints (optionally) an error message and the help message.
    fn print_help(err: Option<&DsdcError>) {
        if let Some(e) = err {
            cprintln!("<bright-red>✗</> {}", e);
        }
        println!("HELP: Supported commands are:");
        println!("          get <key>");
        println!("          mget <key> [keys...]");
        println!("          put <key> <value> [annotation]");
        println!("          remove <key>");
        println!("          lockr|lockw <key> [block]");
        println!("          release <key> <holder>");
        println!("          refresh");
        println!("          help");
        println!("          exit");
        println!(
            "      Keys and values currently cannot contain any whitespaces"
        );
        io::stdout().flush().unwrap();
    }

    /// Expect to get the next segment string from parsed segs.
    fn expect_next_seg<'s>(
        segs: &mut SplitWhitespace<'s>,
    ) -> Result<&'s str, DsdcError> {
        if let Some(seg) = segs.next() {
            Ok(seg)
        } else {
            let err = DsdcError::msg("not enough args");
            Self::print_help(Some(&err));
            Err(err)
        }
    }

    /// Reads in user input and parses into a command.
    fn read_command(&mut self) -> Result<ReplCommand, DsdcError> {
        self.input_buf.clear();
        let nread = io::stdin().read_line(&mut self.input_buf)?;
        if nread == 0 {
            return Ok(ReplCommand::Exit);
        }

        let line: &str = self.input_buf.trim();
        if line.is_empty() {
            return Ok(ReplCommand::Nothing);
        }

        let mut segs = self.input_buf.split_whitespace();

        // get command type, match case-insensitively
        let cmd_type = segs.next().unwrap_or_default();
        match &cmd_type.to_lowercase()[..] {
            "get" => {
                let key = Key::of_name(Self::expect_next_seg(&mut segs)?);
                Ok(ReplCommand::Get(key))
            }

            "mget" => {
                let mut keys = vec![Key::of_name(Self::expect_next_seg(
                    &mut segs,
                )?)];
                keys.extend(segs.map(Key::of_name));
                Ok(ReplCommand::MGet(keys))
            }

            "put" => {
                let key = Key::of_name(Self::expect_next_seg(&mut segs)?);
                let value =
                    Self::expect_next_seg(&mut segs)?.as_bytes().to_vec();
                let annotation = segs.next().map(str::to_owned);
                Ok(ReplCommand::Put {
                    key,
                    value,
                    annotation,
                })
            }

            "remove" | "del" => {
                let key = Key::of_name(Self::expect_next_seg(&mut segs)?);
                Ok(ReplCommand::Remove(key))
            }

            "lockr" | "lockw" => {
                let writer = cmd_type.eq_ignore_ascii_case("lockw");
                let key = Key::of_name(Self::expect_next_seg(&mut segs)?);
                let block = matches!(segs.next(), Some("block"));
                Ok(ReplCommand::Lock { key, writer, block })
            }

            "release" => {
                let key = Key::of_name(Self::expect_next_seg(&mut segs)?);
                let holder = match Self::expect_next_seg(&mut segs)?
                    .parse::<HolderId>()
                {
                    Ok(holder) => holder,
                    Err(e) => {
                        let err = DsdcError::from(e);
                        Self::print_help(Some(&err));
                        return Err(err);
                    }
                };
                Ok(ReplCommand::Release { key, holder })
            }

            "refresh" => Ok(ReplCommand::Refresh),

            "help" => Ok(ReplCommand::PrintHelp),

            "exit" => Ok(ReplCommand::Exit),

            _ => {
                let err = DsdcError::msg(format!(
                    "command '{}' unrecognized",
                    cmd_type
                ));
                Self::print_help(Some(&err));
                Err(err)
            }
        }
    }

    fn print_status(status: Status) {
        match status {
            Status::Ok | Status::Inserted | Status::Replaced => {
                cprintln!("<bright-green>✓</> {:?}", status)
            }
            _ => cprintln!("<bright-red>✗</> {:?}", status),
        }
    }

    fn print_value(value: Option<&[u8]>) {
        match value {
            Some(bytes) => cprintln!(
                "<bright-green>✓</> '{}'",
                String::from_utf8_lossy(bytes)
            ),
            None => cprintln!("<bright-red>✗</> (nil)"),
        }
    }

    /// Evaluates one command. Returns false if the client should exit.
    async fn eval_command(
        &mut self,
        cmd: ReplCommand,
    ) -> Result<bool, DsdcError> {
        match cmd {
            ReplCommand::Get(key) => {
                let result = self.cli.get(&key, self.safe).await?;
                match result.status {
                    Status::Ok => {
                        Self::print_value(result.value.as_deref())
                    }
                    status => Self::print_status(status),
                }
            }

            ReplCommand::MGet(keys) => {
                for result in self.cli.mget(&keys).await? {
                    match result.status {
                        Status::Ok => {
                            Self::print_value(result.value.as_deref())
                        }
                        status => Self::print_status(status),
                    }
                }
            }

            ReplCommand::Put {
                key,
                value,
                annotation,
            } => {
                let cksum = Key::digest(&value);
                let status = self
                    .cli
                    .put(key, value, annotation, Some(cksum), self.safe)
                    .await?;
                Self::print_status(status);
            }

            ReplCommand::Remove(key) => {
                let status = self.cli.remove(&key, self.safe).await?;
                Self::print_status(status);
            }

            ReplCommand::Lock { key, writer, block } => {
                let (status, holder) = self
                    .cli
                    .lock_acquire(key, writer, block, None, self.safe)
                    .await?;
                match holder {
                    Some(holder) => cprintln!(
                        "<bright-green>✓</> granted, holder {}",
                        holder
                    ),
                    None => Self::print_status(status),
                }
            }

            ReplCommand::Release { key, holder } => {
                let status =
                    self.cli.lock_release(key, holder, self.safe).await?;
                Self::print_status(status);
            }

            ReplCommand::Refresh => {
                let changed = self.cli.refresh().await?;
                cprintln!(
                    "<bright-green>✓</> snapshot {}",
                    if changed { "changed" } else { "unchanged" }
                );
            }

            ReplCommand::PrintHelp => Self::print_help(None),

            ReplCommand::Exit => {
                println!("Exitting...");
                return Ok(false);
            }

            ReplCommand::Nothing => {}
        }
        io::stdout().flush()?;
        Ok(true)
    }

    /// One iteration of the REPL loop.
    async fn iter(&mut self) -> Result<bool, DsdcError> {
        Self::print_prompt();
        match self.read_command() {
            Ok(cmd) => self.eval_command(cmd).await,
            // command parse errors are already printed with help
            Err(_) => Ok(true),
        }
    }

    /// Runs the REPL loop until exit.
    pub(crate) async fn run(&mut self) -> Result<(), DsdcError> {
        while self.iter().await? {}
        self.cli.leave().await;
        Ok(())
    }
}
