//! `uart54`: command-line tools for UART54 ASIC links.
//!
//! ```text
//! USAGE:
//!   uart54 serve                          Publish received words, serve control requests
//!   uart54 send <channel> <word>          Send one raw word
//!   uart54 write-config <chip> <reg> <d>  Encode a register write, send on every channel
//!   uart54 send-loop <channel>            Send an incrementing counter
//!   uart54 dump                           Print words received on every channel
//!   uart54 set-clock <khz>                Program the ASIC clock divider
//!   uart54 reset                          Pulse system reset
//!   uart54 ctl <addr> <CMD> [ARG]         Send one control request
//! ```
//!
//! Long-running commands stop when `q` is entered on stdin.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uart54_chip::{decode_word, Word};
use uart54_driver::control::{self, ControlHandler, ControlServer};
use uart54_driver::{ChannelDispatcher, ChannelId, Link, LinkConfig, StreamPublisher, TcpPublisher};

#[derive(Parser)]
#[command(name = "uart54", about = "UART54 ASIC link tools", version)]
struct Cli {
    /// Configuration file (default: $UART54_CONFIG, else built-in defaults).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Use simulated registers instead of /dev/mem.
    #[arg(long, global = true)]
    simulate: bool,
    /// Log at info level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run producers, the dispatcher, the data publisher and the control server.
    Serve,
    /// Send one raw 64-bit word.
    Send {
        /// Channel letter (A-D) or index (0-3).
        channel: ChannelId,
        /// Word value (decimal or 0x hex).
        #[arg(value_parser = parse_u64)]
        word: u64,
    },
    /// Encode a "write register" command and send it on every channel.
    WriteConfig {
        /// Chip id (8 bits).
        #[arg(value_parser = parse_u64)]
        chip: u64,
        /// Register address (8 bits).
        #[arg(value_parser = parse_u64)]
        register: u64,
        /// Data (35 bits).
        #[arg(value_parser = parse_u64)]
        data: u64,
    },
    /// Send an incrementing counter on one channel.
    SendLoop {
        /// Channel letter (A-D) or index (0-3).
        channel: ChannelId,
        /// Pause between words in microseconds.
        #[arg(long, default_value_t = 1000)]
        delay_us: u64,
        /// Stop after this many words.
        #[arg(long)]
        count: Option<u64>,
    },
    /// Print words received on every channel.
    Dump {
        /// Stop after this many words.
        #[arg(long)]
        count: Option<u64>,
    },
    /// Program the ASIC clock.
    SetClock {
        /// Target frequency in kHz.
        khz: u32,
    },
    /// Pulse the ASIC system reset line.
    Reset,
    /// Send one request to a running control server.
    Ctl {
        /// Server address (host:port).
        addr: String,
        /// Seven-character command (SETFREQ, SNDWORD, SYRESET, GETSTAT, SETCONF).
        command: String,
        /// Argument(s).
        args: Vec<String>,
        /// Reply timeout in milliseconds.
        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()),
        )
        .init();

    match cli.command {
        Cmd::Serve => cmd_serve(&open_link(&cli)?)?,
        Cmd::Send { channel, word } => cmd_send(&open_link(&cli)?, channel, word)?,
        Cmd::WriteConfig { chip, register, data } => {
            cmd_write_config(&open_link(&cli)?, chip, register, data)?;
        }
        Cmd::SendLoop {
            channel,
            delay_us,
            count,
        } => cmd_send_loop(&open_link(&cli)?, channel, Duration::from_micros(delay_us), count)?,
        Cmd::Dump { count } => cmd_dump(&open_link(&cli)?, count)?,
        Cmd::SetClock { khz } => {
            let actual = open_link(&cli)?.board().set_clock_khz(khz)?;
            println!("Clock set to {actual} kHz");
        }
        Cmd::Reset => {
            open_link(&cli)?.board().system_reset()?;
            println!("System reset done");
        }
        Cmd::Ctl {
            ref addr,
            ref command,
            ref args,
            timeout_ms,
        } => {
            let line = std::iter::once(command.as_str())
                .chain(args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ");
            let reply = control::request(addr.as_str(), &line, Duration::from_millis(timeout_ms))
                .with_context(|| format!("control request to {addr}"))?;
            println!("{reply}");
        }
    }

    Ok(())
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid number '{s}': {e}"))
}

fn open_link(cli: &Cli) -> Result<Link> {
    let config = LinkConfig::resolve(cli.config.as_deref()).context("loading configuration")?;
    if cli.simulate {
        Ok(Link::simulated(config)?)
    } else {
        Link::open(config).context("opening link (root and /dev/mem access required; try --simulate)")
    }
}

/// Flag set once `q` is entered on stdin
fn quit_on_keypress() -> Result<Arc<AtomicBool>> {
    let quit = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&quit);
    std::thread::Builder::new()
        .name("uart54-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(l) if l.trim().eq_ignore_ascii_case("q") => {
                        flag.store(true, Ordering::Release);
                        return;
                    }
                    Ok(_) => {}
                    Err(_) => return,
                }
            }
        })?;
    Ok(quit)
}

fn cmd_serve(link: &Link) -> Result<()> {
    let config = link.config();
    let accumulators = link.accumulators()?;
    let producers = link.start_producers(&accumulators)?;

    let publisher = Arc::new(StreamPublisher::new(TcpPublisher::bind_with_write_timeout(
        config.publisher.bind.as_str(),
        config.publisher.write_timeout(),
    )?));
    let handler = ControlHandler::new(
        link.board().clone(),
        link.channels().to_vec(),
        link.codec(),
        config.send_timeout(),
    );
    let _control = ControlServer::spawn(config.control.bind.as_str(), Arc::new(handler))?;

    println!(
        "Serving {} channels: data on {}, control on {} (q to quit)",
        link.channels().len(),
        publisher.transport().local_addr(),
        config.control.bind
    );

    let quit = quit_on_keypress()?;
    let mut dispatcher = ChannelDispatcher::new(
        accumulators.clone(),
        Arc::clone(&publisher),
        config.dispatcher.poll_order(),
        config.dispatcher.wait_strategy(),
    );
    let stats = dispatcher.run(&quit)?;
    tracing::info!("Stopping producers");
    drop(producers);

    println!(
        "Dispatcher: {} iterations, {} buffers published, {} idle",
        stats.iterations, stats.published, stats.idle_iterations
    );
    println!(
        "Publisher : {} published, {} dropped while busy",
        publisher.published(),
        publisher.busy_drops()
    );
    for acc in &accumulators {
        println!(
            "Channel {} : {} words stored, {} dropped on overflow",
            acc.channel(),
            acc.stored_words(),
            acc.dropped_words()
        );
    }
    Ok(())
}

fn cmd_send(link: &Link, channel: ChannelId, word: u64) -> Result<()> {
    let word = Word::from_raw(word);
    link.channel(channel)?
        .send_word(word, link.config().send_timeout())
        .with_context(|| format!("sending {word} on channel {channel}"))?;
    println!("Channel {channel}: sent {word}");
    Ok(())
}

fn cmd_write_config(link: &Link, chip: u64, register: u64, data: u64) -> Result<()> {
    let word = link.codec().encode_config_command(chip, register, data)?;
    println!("Encoded chip={chip} reg={register} data={data:#x} as {word}");
    for ch in link.channels() {
        ch.send_word(word, link.config().send_timeout())
            .with_context(|| format!("sending on channel {}", ch.id()))?;
        println!("Channel {}: sent", ch.id());
    }
    Ok(())
}

fn cmd_send_loop(link: &Link, channel: ChannelId, delay: Duration, count: Option<u64>) -> Result<()> {
    let ch = link.channel(channel)?;
    let quit = quit_on_keypress()?;
    let mut sent = 0u64;
    while !quit.load(Ordering::Acquire) && count.map_or(true, |c| sent < c) {
        ch.send_word(Word::from_raw(sent), link.config().send_timeout())
            .with_context(|| format!("sending word {sent} on channel {channel}"))?;
        sent += 1;
        std::thread::sleep(delay);
    }
    println!("Channel {channel}: sent {sent} words");
    Ok(())
}

fn cmd_dump(link: &Link, count: Option<u64>) -> Result<()> {
    let quit = quit_on_keypress()?;
    let wait = link.config().dispatcher.wait_strategy();
    let mut seen = 0u64;
    while !quit.load(Ordering::Acquire) && count.map_or(true, |c| seen < c) {
        let mut idle = true;
        for ch in link.channels() {
            if let Some(word) = ch.try_receive_word()? {
                let (ready, payload) = decode_word(word);
                println!("{} {word} ready={} payload={payload:#016x}", ch.id(), u8::from(ready));
                seen += 1;
                idle = false;
            }
        }
        if idle {
            wait.idle();
        }
    }
    Ok(())
}
