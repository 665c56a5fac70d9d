//! Gridwatch cluster node executable.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use gridwatch::{
    logger_init, pf_debug, pf_error, pf_info, pf_warn, select_buddies,
    GridError, LivenessRing, Member, MemberId, MemberSet, RingNotice,
    ServiceCore,
};
use log::{self, LevelFilter};
use rand::Rng;
use tokio::runtime::Builder;
use tokio::sync::watch;
use tokio::time::{self, Duration, MissedTickBehavior};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Member ID of this node; must be non-zero and unique in the cluster.
    #[arg(short, long)]
    id: MemberId,

    /// Local IP to use for binding the ring listener.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Ring listener port.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 52700)]
    ring_port: u16,

    /// Other cluster members, each given as 'id@host:port'
    /// (e.g., '-p 2@10.0.0.2:52700 -p 3@10.0.0.3:52700').
    #[arg(short, long = "peer")]
    peers: Vec<String>,

    /// Number of buddies this node watches.
    #[arg(long, default_value_t = 1)]
    buddies: usize,

    /// Ring configuration TOML string.
    #[arg(short, long)]
    config: Option<String>,

    /// Service configuration TOML string.
    #[arg(short, long)]
    service_config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(peers)` on success or
    /// `Err(GridError)` on any error.
    fn sanitize(&self) -> Result<Vec<Member>, GridError> {
        if self.id == 0 {
            return Err(GridError::msg("invalid member id 0"));
        }
        if self.ring_port <= 1024 {
            return Err(GridError::msg(format!(
                "invalid ring_port {}",
                self.ring_port
            )));
        }
        if self.buddies == 0 {
            return Err(GridError::msg("invalid number of buddies 0"));
        }
        if self.threads < 2 {
            return Err(GridError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }

        let mut peers = vec![];
        let mut ids = HashSet::new();
        for s in self.peers.iter() {
            let Some((id, addr)) = s.split_once('@') else {
                return Err(GridError::msg(format!(
                    "peer '{}' not in 'id@host:port' form",
                    s
                )));
            };
            let id: MemberId = id.parse()?;
            let addr: SocketAddr = addr.parse()?;
            if id == 0 || id == self.id {
                return Err(GridError::msg(format!(
                    "invalid peer member id {}",
                    id
                )));
            }
            if !ids.insert(id) {
                return Err(GridError::msg(format!(
                    "duplicate peer member id {} given",
                    id
                )));
            }
            peers.push(Member::new(id, addr));
        }
        Ok(peers)
    }
}

/// Main event loop of a node: heartbeats, ring notices, and termination.
async fn node_loop(
    args: &CliArgs,
    mut members: Vec<Member>,
    service: Arc<ServiceCore>,
    ring: Arc<LivenessRing>,
    mut rx_term: watch::Receiver<bool>,
) -> Result<(), GridError> {
    let interval_ms = ring.config().heartbeat_interval_ms;
    let mut heartbeat = time::interval(Duration::from_millis(interval_ms));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    ring.ensure_topology(&select_buddies(&members, args.id, args.buddies));
    pf_info!("watching buddies {}", ring);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                // spread heartbeats of different nodes apart
                let jitter = rand::thread_rng().gen_range(0..=interval_ms / 10);
                time::sleep(Duration::from_millis(jitter)).await;
                ring.heartbeat_buddies();
            },

            notice = ring.get_notice() => {
                match notice? {
                    RingNotice::DeadBuddy { member, reason } => {
                        pf_warn!("member {} declared dead: {}", member, reason);
                        members.retain(|m| m.id != member.id);
                        service.member_left(member.id);
                        ring.ensure_topology(&select_buddies(
                            &members, args.id, args.buddies,
                        ));
                        pf_info!("watching buddies {}", ring);
                    }
                    RingNotice::Isolated => {
                        pf_warn!("no member is watching this node");
                    }
                }
            },

            _ = rx_term.changed() => {
                pf_warn!("node caught termination signal");
                break;
            }
        }
    }

    pf_debug!("ring stats: {}", ring.format_stats());
    Ok(())
}

/// Actual main function of a Gridwatch node.
fn node_main(args: CliArgs) -> Result<(), GridError> {
    let peers = args.sanitize()?;

    // parse ring listener address
    let ring_addr: SocketAddr = format!("{}:{}", args.bind_ip, args.ring_port)
        .parse()
        .map_err(|e| {
            GridError::msg(format!(
                "failed to parse ring_addr: bind_ip {} port {}: {}",
                args.bind_ip, args.ring_port, e
            ))
        })?;

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
            .thread_name("tokio-worker-node")
            .build()?;

        runtime.block_on(async move {
            let service = ServiceCore::new_and_setup(
                "gridwatch",
                args.id,
                args.service_config.as_deref(),
            )?;
            service.start(MemberSet::from_ids(peers.iter().map(|m| m.id)));

            let ring = Arc::new(
                LivenessRing::new_and_setup(
                    args.id,
                    ring_addr,
                    args.config.as_deref(),
                )
                .await?,
            );

            let ring_ref = ring.clone();
            let selector = tokio::spawn(async move {
                while !ring_ref.is_closed() {
                    if let Err(e) = ring_ref.select(0).await {
                        if !ring_ref.is_closed() {
                            pf_error!("ring select failed: {}", e);
                        }
                    }
                }
            });

            let service_ref = service.clone();
            let tasks = tokio::spawn(async move { service_ref.run_tasks().await });

            let mut members = peers;
            members.push(Member::new(args.id, ring.local_addr()));
            let result =
                node_loop(&args, members, service.clone(), ring.clone(), rx_term)
                    .await;

            ring.close().await;
            selector.await?;
            service.stop();
            tasks.abort();

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            result
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of a Gridwatch node.
fn main() -> ExitCode {
    let args = CliArgs::parse();
    logger_init(format!("m{}", args.id));

    if let Err(ref e) = node_main(args) {
        pf_error!("node_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn args(id: MemberId, peers: &[&str]) -> CliArgs {
        CliArgs {
            id,
            bind_ip: Ipv4Addr::LOCALHOST,
            ring_port: 52700,
            peers: peers.iter().map(|s| s.to_string()).collect(),
            buddies: 1,
            config: None,
            service_config: None,
            threads: 2,
        }
    }

    #[test]
    fn sanitize_valid() -> Result<(), GridError> {
        let peers = args(1, &["2@127.0.0.1:52702", "3@127.0.0.1:52703"])
            .sanitize()?;
        assert_eq!(
            peers,
            vec![
                Member::new(2, "127.0.0.1:52702".parse()?),
                Member::new(3, "127.0.0.1:52703".parse()?),
            ]
        );
        assert!(args(1, &[]).sanitize()?.is_empty());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_id() {
        assert!(args(0, &[]).sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_ring_port() {
        let mut a = args(1, &[]);
        a.ring_port = 1023;
        assert!(a.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_threads() {
        let mut a = args(1, &[]);
        a.threads = 1;
        assert!(a.sanitize().is_err());
    }

    #[test]
    fn sanitize_bad_peers() {
        assert!(args(1, &["127.0.0.1:52702"]).sanitize().is_err());
        assert!(args(1, &["x@127.0.0.1:52702"]).sanitize().is_err());
        assert!(args(1, &["2@nowhere"]).sanitize().is_err());
        assert!(args(1, &["1@127.0.0.1:52702"]).sanitize().is_err());
        assert!(args(1, &["0@127.0.0.1:52702"]).sanitize().is_err());
        assert!(args(
            1,
            &["2@127.0.0.1:52702", "2@127.0.0.1:52703"]
        )
        .sanitize()
        .is_err());
    }
}
