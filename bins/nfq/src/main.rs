//! nfq command - bind a netfilter queue, print packets and issue verdicts.

mod output;

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use nfqueue::netlink::SocketOption;
use nfqueue::queue::{
    Config, CopyMode, NetNs, Packet, Queue, Verdict, VerdictDispatch, VerdictOption, flags,
};
use output::OutputFormat;
use tokio::sync::watch;

const NETNS_RUN_DIR: &str = "/var/run/netns";

#[derive(Parser)]
#[command(name = "nfq", version, about = "Netfilter queue tool")]
struct Cli {
    /// Queue number.
    #[arg(short, long, default_value_t = 0)]
    queue: u16,

    /// Bind the IPv6 family instead of IPv4.
    #[arg(short = '6')]
    ipv6: bool,

    /// Network namespace name (under /var/run/netns) or path.
    #[arg(long)]
    netns: Option<String>,

    /// How much of each packet to copy.
    #[arg(long, value_enum, default_value_t = CopyArg::Packet)]
    copy: CopyArg,

    /// Maximum payload bytes copied per packet.
    #[arg(long, default_value_t = 0xffff)]
    copy_range: u32,

    /// Maximum packets held by the kernel (0 = kernel default).
    #[arg(long, default_value_t = 1024)]
    max_queue_len: u32,

    /// Accept packets when the queue is full.
    #[arg(long)]
    fail_open: bool,

    /// Attach conntrack information.
    #[arg(long)]
    conntrack: bool,

    /// Receive GSO packets unsegmented.
    #[arg(long)]
    gso: bool,

    /// Attach socket owner UID/GID.
    #[arg(long)]
    uid_gid: bool,

    /// Attach the security context.
    #[arg(long)]
    secctx: bool,

    /// Verdict for every packet.
    #[arg(short, long, value_enum, default_value_t = VerdictArg::Accept)]
    verdict: VerdictArg,

    /// Set the packet mark with the verdict.
    #[arg(long)]
    mark: Option<u32>,

    /// Set the connection mark with the verdict.
    #[arg(long)]
    connmark: Option<u32>,

    /// Send verdicts in batches from the receive loop.
    #[arg(long)]
    buffered: bool,

    /// Exit after this many packets.
    #[arg(short, long)]
    count: Option<u64>,

    /// Receive timeout in milliseconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    json: bool,

    /// Pretty print JSON.
    #[arg(short = 'p', long)]
    pretty: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum CopyArg {
    None,
    Meta,
    Packet,
}

#[derive(Clone, Copy, ValueEnum)]
enum VerdictArg {
    Accept,
    Drop,
    Repeat,
}

impl Cli {
    fn config(&self) -> Config {
        let mut queue_flags = 0;
        for (set, flag) in [
            (self.fail_open, flags::FAIL_OPEN),
            (self.conntrack, flags::CONNTRACK),
            (self.gso, flags::GSO),
            (self.uid_gid, flags::UID_GID),
            (self.secctx, flags::SECCTX),
        ] {
            if set {
                queue_flags |= flag;
            }
        }

        let family = if self.ipv6 {
            libc::AF_INET6
        } else {
            libc::AF_INET
        };

        let mut config = Config::new(self.queue)
            .family(family as u8)
            .copy_mode(match self.copy {
                CopyArg::None => CopyMode::None,
                CopyArg::Meta => CopyMode::Meta,
                CopyArg::Packet => CopyMode::Packet,
            })
            .max_packet_len(self.copy_range)
            .max_queue_len(self.max_queue_len)
            .flags(queue_flags);

        if let Some(name) = &self.netns {
            let path = if name.contains('/') {
                PathBuf::from(name)
            } else {
                PathBuf::from(NETNS_RUN_DIR).join(name)
            };
            config = config.netns(NetNs::Path(path));
        }
        if let Some(ms) = self.timeout {
            config = config.read_timeout(Duration::from_millis(ms));
        }
        if self.buffered {
            config = config.verdict_dispatch(VerdictDispatch::Buffered);
        }
        config
    }

    fn verdict(&self) -> Verdict {
        match self.verdict {
            VerdictArg::Accept => Verdict::Accept,
            VerdictArg::Drop => Verdict::Drop,
            VerdictArg::Repeat => Verdict::Repeat,
        }
    }

    fn verdict_options(&self) -> Vec<VerdictOption> {
        let mut options = Vec::new();
        if let Some(mark) = self.mark {
            options.push(VerdictOption::Mark(mark));
        }
        if let Some(mark) = self.connmark {
            options.push(VerdictOption::ConnMark(mark));
        }
        options
    }

    fn format(&self) -> OutputFormat {
        if self.json {
            OutputFormat::Json { pretty: self.pretty }
        } else {
            OutputFormat::Text
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    let mut queue = Queue::open(cli.config())?;
    if let Err(e) = queue.set_option(SocketOption::NoEnobufs, true) {
        tracing::warn!(error = %e, "could not disable ENOBUFS reports");
    }

    let verdicts = queue.verdicts();
    let verdict = cli.verdict();
    let options = cli.verdict_options();
    let format = cli.format();
    let limit = cli.count;
    let mut seen = 0u64;
    let (cancel, cancel_rx) = watch::channel(false);

    let result = queue
        .register(cancel_rx, move |pkt: Packet| {
            seen += 1;
            format.print(&pkt);
            let done = limit.is_some_and(|n| seen >= n);
            let verdicts = verdicts.clone();
            let options = options.clone();
            async move {
                if let Err(e) = verdicts
                    .set_verdict_with_options(pkt.id, verdict, options)
                    .await
                {
                    tracing::warn!(id = pkt.id, error = %e, "failed to set verdict");
                }
                if done {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            }
        })
        .await;

    if let Err(e) = result {
        if e.is_permission_denied() {
            eprintln!("Error: {} (requires CAP_NET_ADMIN)", e);
        } else {
            eprintln!("Error: {}", e);
        }
        queue.close().await?;
        std::process::exit(1);
    }

    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r?;
            cancel.send_replace(true);
        }
        r = queue.wait() => r?,
    }

    queue.close().await?;
    Ok(())
}
