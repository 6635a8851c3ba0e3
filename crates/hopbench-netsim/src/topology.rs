//! Three hosts behind a Linux router, one network namespace per node.
//!
//! ```text
//!  h1 (client) 10.0.1.10 ── r-eth1 10.0.1.1 ┐
//!  h2 (aux)    10.0.2.10 ── r-eth2 10.0.2.1 ├─ router
//!  h3 (target) 10.0.3.10 ── r-eth3 10.0.3.1 ┘
//! ```
//!
//! Links 1 and 2 model fixed access links. Link 3 is shaped from the active
//! [`ImpairmentProfile`] on both ends, with a bounded netem queue on the
//! router side.

use std::io;
use std::process::Child;
use std::time::Duration;

use crate::impairment::{apply_fq, apply_shaping, LinkShaping};
use crate::namespace::Namespace;
use crate::profile::ImpairmentProfile;

/// Nodes of the topology, in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    Router,
    /// h1, runs the transfer client.
    Client,
    /// h2, idle auxiliary host.
    Aux,
    /// h3, runs the servers and receives files.
    Target,
}

impl Node {
    pub const ALL: [Node; 4] = [Node::Router, Node::Client, Node::Aux, Node::Target];
    const HOSTS: [Node; 3] = [Node::Client, Node::Aux, Node::Target];

    fn index(self) -> usize {
        self as usize
    }

    /// 1-based subnet index of a host; the router has none.
    fn subnet(self) -> Option<u8> {
        match self {
            Node::Router => None,
            Node::Client => Some(1),
            Node::Aux => Some(2),
            Node::Target => Some(3),
        }
    }

    fn label(self) -> String {
        match self.subnet() {
            Some(i) => format!("h{i}"),
            None => "r".to_string(),
        }
    }
}

/// Profile-independent topology settings.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Prefix for namespace and veth names; at most 8 characters so
    /// interface names stay within the 15 character limit.
    pub prefix: String,
    /// netem queue capacity on the router side of the variable link.
    pub queue_limit: u32,
    pub client_link: LinkShaping,
    pub aux_link: LinkShaping,
    /// Start an sshd in every node (needed by the ssh baseline).
    pub sshd: Option<String>,
    /// Server started in the target host, e.g. the candidate's daemon.
    pub target_server: Option<Vec<String>>,
    /// Directory on the target that receives transferred files.
    pub dest_dir: String,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            prefix: "hb".to_string(),
            queue_limit: 200,
            client_link: LinkShaping::fixed(100.0, Some(Duration::from_millis(10))),
            aux_link: LinkShaping::fixed(80.0, None),
            sshd: None,
            target_server: None,
            dest_dir: "/tmp/file".to_string(),
        }
    }
}

impl TopologyConfig {
    pub fn namespace_name(&self, node: Node) -> String {
        format!("{}-{}", self.prefix, node.label())
    }

    fn host_veth(&self, node: Node) -> String {
        format!("{}h{}", self.prefix, node.subnet().unwrap_or(0))
    }

    fn router_veth(&self, node: Node) -> String {
        format!("{}r{}", self.prefix, node.subnet().unwrap_or(0))
    }
}

pub fn host_addr(node: Node) -> Option<String> {
    node.subnet().map(|i| format!("10.0.{i}.10"))
}

fn gateway_addr(node: Node) -> Option<String> {
    node.subnet().map(|i| format!("10.0.{i}.1"))
}

/// A live topology. Owns its namespaces and the processes started in them.
///
/// Call [`Topology::teardown`] to release it and observe failures; dropping
/// it performs the same cleanup silently.
#[derive(Debug)]
pub struct Topology {
    config: TopologyConfig,
    profile: ImpairmentProfile,
    nodes: Vec<Namespace>,
    servers: Vec<Child>,
}

impl Topology {
    /// Builds the topology for `profile`. On failure everything created so
    /// far is torn down before the error is returned.
    pub fn build(config: &TopologyConfig, profile: &ImpairmentProfile) -> io::Result<Self> {
        let mut topology = Self {
            config: config.clone(),
            profile: profile.clone(),
            nodes: Vec::with_capacity(Node::ALL.len()),
            servers: Vec::new(),
        };

        if let Err(err) = topology.bring_up() {
            tracing::error!(profile = %profile.name, error = %err, "topology build failed");
            if let Err(cleanup) = topology.release() {
                tracing::warn!(error = %cleanup, "cleanup after failed build also failed");
            }
            return Err(err);
        }

        tracing::info!(
            profile = %profile.name,
            bandwidth_mbps = profile.bandwidth_mbps,
            delay_ms = profile.delay.as_millis() as u64,
            jitter_ms = profile.jitter.as_millis() as u64,
            loss_pct = profile.loss_pct,
            "topology ready"
        );
        Ok(topology)
    }

    fn bring_up(&mut self) -> io::Result<()> {
        for node in Node::ALL {
            let ns = Namespace::new(&self.config.namespace_name(node))?;
            self.nodes.push(ns);
        }

        self.node(Node::Router).sysctl("net.ipv4.ip_forward=1")?;

        for host in Node::HOSTS {
            let (Some(addr), Some(gateway)) = (host_addr(host), gateway_addr(host)) else {
                continue;
            };
            self.node(host).add_veth_link(
                self.node(Node::Router),
                &self.config.host_veth(host),
                &self.config.router_veth(host),
                &format!("{addr}/24"),
                &format!("{gateway}/24"),
            )?;
            self.node(host).set_default_route(&gateway)?;
        }

        let variable = LinkShaping::from_profile(&self.profile);
        let links = [
            (Node::Client, self.config.client_link.clone(), self.config.client_link.clone()),
            (Node::Aux, self.config.aux_link.clone(), self.config.aux_link.clone()),
            (
                Node::Target,
                variable.clone(),
                variable.with_limit(self.config.queue_limit),
            ),
        ];
        for (host, host_side, router_side) in &links {
            apply_shaping(self.node(*host), &self.config.host_veth(*host), host_side)?;
            apply_shaping(
                self.node(Node::Router),
                &self.config.router_veth(*host),
                router_side,
            )?;
        }

        self.reassert_router()?;

        // Host egress on the fixed links is left unshaped
        for host in [Node::Client, Node::Aux] {
            apply_fq(self.node(host), &self.config.host_veth(host))?;
        }

        self.start_servers()?;
        self.clear_dest_dir()?;
        Ok(())
    }

    /// Re-applies the router's addresses and forwarding flag; namespace
    /// setup does not guarantee they survived link configuration.
    fn reassert_router(&self) -> io::Result<()> {
        let router = self.node(Node::Router);
        for host in Node::HOSTS {
            if let Some(gateway) = gateway_addr(host) {
                router.set_address(&self.config.router_veth(host), &format!("{gateway}/24"))?;
            }
        }
        router.sysctl("net.ipv4.ip_forward=1")
    }

    fn start_servers(&mut self) -> io::Result<()> {
        if let Some(sshd) = self.config.sshd.clone() {
            for node in Node::ALL {
                let child = self.node(node).spawn(&[sshd.clone()])?;
                self.servers.push(child);
            }
        }
        if let Some(argv) = self.config.target_server.clone() {
            tracing::debug!(command = ?argv, "starting target server");
            let child = self.node(Node::Target).spawn(&argv)?;
            self.servers.push(child);
        }
        Ok(())
    }

    /// Empties (and creates) the destination directory on the target.
    pub fn clear_dest_dir(&self) -> io::Result<()> {
        let dir = &self.config.dest_dir;
        let output = self
            .node(Node::Target)
            .sh(&format!("mkdir -p '{dir}' && rm -rf '{dir}'/*"))?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "Failed to clear {dir}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    pub fn node(&self, node: Node) -> &Namespace {
        &self.nodes[node.index()]
    }

    pub fn profile(&self) -> &ImpairmentProfile {
        &self.profile
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    /// Address of the target host as seen from the client.
    pub fn target_addr(&self) -> String {
        host_addr(Node::Target).unwrap_or_default()
    }

    /// Removes every namespace and process of this topology, reporting the
    /// first failure.
    pub fn teardown(mut self) -> io::Result<()> {
        let result = self.release();
        match &result {
            Ok(()) => tracing::info!(profile = %self.profile.name, "topology torn down"),
            Err(err) => {
                tracing::error!(profile = %self.profile.name, error = %err, "topology teardown failed")
            }
        }
        result
    }

    fn release(&mut self) -> io::Result<()> {
        let mut first_err: Option<io::Error> = None;
        let mut note = |res: io::Result<()>| {
            if let Err(e) = res {
                first_err.get_or_insert(e);
            }
        };

        for ns in &self.nodes {
            note(ns.kill_all());
        }
        for mut child in self.servers.drain(..) {
            // kill_all already signalled it; this only reaps
            let _ = child.kill();
            note(child.wait().map(|_| ()));
        }
        if let Some(router) = self.nodes.get(Node::Router.index()) {
            note(router.sysctl("net.ipv4.ip_forward=0"));
        }
        for ns in self.nodes.drain(..) {
            note(ns.delete());
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Topology {
    fn drop(&mut self) {
        if !self.nodes.is_empty() || !self.servers.is_empty() {
            let _ = self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace;
    use crate::test_util::{check_privileges, unique_ns_name};

    #[test]
    fn names_stay_within_interface_limit() {
        let config = TopologyConfig {
            prefix: "hb123456".into(),
            ..Default::default()
        };
        for node in Node::HOSTS {
            assert!(config.host_veth(node).len() <= 15);
            assert!(config.router_veth(node).len() <= 15);
        }
        assert_eq!(config.namespace_name(Node::Router), "hb123456-r");
        assert_eq!(config.namespace_name(Node::Target), "hb123456-h3");
        assert_eq!(config.router_veth(Node::Target), "hb123456r3");
    }

    #[test]
    fn addressing_plan() {
        assert_eq!(host_addr(Node::Client).as_deref(), Some("10.0.1.10"));
        assert_eq!(host_addr(Node::Target).as_deref(), Some("10.0.3.10"));
        assert_eq!(gateway_addr(Node::Aux).as_deref(), Some("10.0.2.1"));
        assert_eq!(host_addr(Node::Router), None);
    }

    #[test]
    fn test_build_route_and_teardown() {
        if !check_privileges() {
            eprintln!("Skipping test_build_route_and_teardown, insufficient privileges");
            return;
        }

        let prefix = unique_ns_name("t");
        let config = TopologyConfig {
            prefix: prefix[..prefix.len().min(8)].to_string(),
            ..Default::default()
        };
        let profile = ImpairmentProfile::new("bw_10Mbps", 10.0, 10, 0, 0.0);
        let topo = match Topology::build(&config, &profile) {
            Ok(t) => t,
            Err(err) if err.to_string().contains("qdisc kind is unknown") => {
                eprintln!("Skipping, netem qdisc not available");
                return;
            }
            Err(err) => panic!("build failed: {err}"),
        };

        let out = topo
            .node(Node::Client)
            .exec("ping", &["-c", "1", "-W", "2", &topo.target_addr()])
            .expect("ping");
        assert!(out.status.success(), "client cannot reach target through router");

        let names: Vec<String> = Node::ALL
            .iter()
            .map(|n| config.namespace_name(*n))
            .collect();
        topo.teardown().expect("teardown");
        for name in names {
            assert!(!namespace::exists(&name).unwrap(), "{name} left behind");
        }
    }
}
