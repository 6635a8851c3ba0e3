use std::io;
use std::process::{Child, Command, Output, Stdio};

/// A Linux network namespace managed via `ip netns`.
///
/// Creates the namespace on construction, initializes loopback, and
/// deletes the namespace on drop. Supports executing commands inside
/// the namespace and creating veth links to other namespaces.
///
/// All commands are issued directly, so the harness has to run as root.
#[derive(Debug)]
pub struct Namespace {
    pub name: String,
    deleted: bool,
}

impl Namespace {
    pub fn new(name: &str) -> io::Result<Self> {
        // cleanup any existing namespace with the same name
        let _ = Command::new("ip").args(["netns", "del", name]).output();

        let output = Command::new("ip").args(["netns", "add", name]).output()?;
        check(&output, "create netns")?;

        let ns = Self {
            name: name.to_string(),
            deleted: false,
        };
        // Initialize loopback
        ns.run("ip", &["link", "set", "lo", "up"])?;
        Ok(ns)
    }

    /// Runs a command inside the namespace and returns its raw output.
    pub fn exec(&self, cmd: &str, args: &[&str]) -> io::Result<Output> {
        Command::new("ip")
            .args(["netns", "exec", &self.name, cmd])
            .args(args)
            .output()
    }

    /// Like [`Namespace::exec`], but a non-zero exit status is an error.
    pub fn run(&self, cmd: &str, args: &[&str]) -> io::Result<()> {
        let output = self.exec(cmd, args)?;
        check(&output, &format!("{} {} in {}", cmd, args.join(" "), self.name))
    }

    /// Runs a shell snippet inside the namespace (needed for globs).
    pub fn sh(&self, script: &str) -> io::Result<Output> {
        self.exec("sh", &["-c", script])
    }

    /// Starts a long-running process inside the namespace.
    ///
    /// Output is discarded; the process is expected to be stopped by
    /// [`Namespace::kill_all`].
    pub fn spawn(&self, argv: &[String]) -> io::Result<Child> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::other("empty command"))?;
        Command::new("ip")
            .args(["netns", "exec", &self.name, program])
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
    }

    /// Prefixes `argv` so that it executes inside this namespace.
    pub fn wrap_argv(&self, argv: &[String]) -> Vec<String> {
        let mut wrapped = vec![
            "ip".to_string(),
            "netns".to_string(),
            "exec".to_string(),
            self.name.clone(),
        ];
        wrapped.extend(argv.iter().cloned());
        wrapped
    }

    /// Sets a sysctl inside the namespace, e.g. `net.ipv4.ip_forward=1`.
    pub fn sysctl(&self, assignment: &str) -> io::Result<()> {
        self.run("sysctl", &["-q", "-w", assignment])
    }

    /// Assigns `cidr` to `dev`, replacing an identical existing address.
    pub fn set_address(&self, dev: &str, cidr: &str) -> io::Result<()> {
        self.run("ip", &["addr", "replace", cidr, "dev", dev])
    }

    pub fn set_default_route(&self, gateway: &str) -> io::Result<()> {
        self.run("ip", &["route", "replace", "default", "via", gateway])
    }

    /// PIDs of every process currently running inside the namespace.
    pub fn pids(&self) -> io::Result<Vec<u32>> {
        let output = Command::new("ip")
            .args(["netns", "pids", &self.name])
            .output()?;
        check(&output, "list netns pids")?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .filter_map(|pid| pid.parse().ok())
            .collect())
    }

    /// SIGKILLs every process inside the namespace.
    pub fn kill_all(&self) -> io::Result<()> {
        let pids = self.pids()?;
        if pids.is_empty() {
            return Ok(());
        }
        let pids: Vec<String> = pids.iter().map(u32::to_string).collect();
        tracing::debug!(ns = %self.name, pids = ?pids, "killing namespace processes");
        let output = Command::new("kill").arg("-9").args(&pids).output()?;
        // a process may exit between listing and killing
        if !output.status.success() && !self.pids()?.is_empty() {
            return Err(io::Error::other(format!(
                "Failed to kill processes in {}: {}",
                self.name,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    /// Deletes the namespace now instead of on drop, reporting failures.
    pub fn delete(mut self) -> io::Result<()> {
        self.deleted = true;
        let output = Command::new("ip")
            .args(["netns", "del", &self.name])
            .output()?;
        check(&output, "delete netns")?;
        if exists(&self.name)? {
            return Err(io::Error::other(format!(
                "netns {} still present after delete",
                self.name
            )));
        }
        Ok(())
    }

    pub fn add_veth_link(
        &self,
        other: &Namespace,
        veth_name_local: &str,
        veth_name_peer: &str,
        ip_local: &str,
        ip_peer: &str,
    ) -> io::Result<()> {
        // Clean up potential leftovers in host
        let _ = Command::new("ip")
            .args(["link", "del", veth_name_local])
            .output();

        // 1. Create veth pair in host
        let output = Command::new("ip")
            .args([
                "link",
                "add",
                veth_name_local,
                "type",
                "veth",
                "peer",
                "name",
                veth_name_peer,
            ])
            .output()?;
        check(&output, "create veth pair")?;

        // 2. Move each end into its namespace
        let output = Command::new("ip")
            .args(["link", "set", veth_name_local, "netns", &self.name])
            .output()?;
        check(&output, "move local veth")?;
        let output = Command::new("ip")
            .args(["link", "set", veth_name_peer, "netns", &other.name])
            .output()?;
        check(&output, "move peer veth")?;

        // 3. Address and bring up both sides
        self.set_address(veth_name_local, ip_local)?;
        self.run("ip", &["link", "set", veth_name_local, "up"])?;
        other.set_address(veth_name_peer, ip_peer)?;
        other.run("ip", &["link", "set", veth_name_peer, "up"])?;

        Ok(())
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        if !self.deleted {
            let _ = Command::new("ip")
                .args(["netns", "del", &self.name])
                .status();
        }
    }
}

/// Names of all namespaces on the host.
pub fn list() -> io::Result<Vec<String>> {
    let output = Command::new("ip").args(["netns", "list"]).output()?;
    check(&output, "list netns")?;
    // lines look like "name (id: 3)" or just "name"
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect())
}

pub fn exists(name: &str) -> io::Result<bool> {
    Ok(list()?.iter().any(|n| n == name))
}

/// Deletes every namespace whose name starts with `prefix`, killing the
/// processes left inside first. Returns the deleted names.
pub fn purge_prefixed(prefix: &str) -> io::Result<Vec<String>> {
    let mut purged = Vec::new();
    for name in list()?.into_iter().filter(|n| n.starts_with(prefix)) {
        let ns = Namespace {
            name: name.clone(),
            deleted: false,
        };
        ns.kill_all()?;
        ns.delete()?;
        purged.push(name);
    }
    Ok(purged)
}

fn check(output: &Output, what: &str) -> io::Result<()> {
    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!(
            "Failed to {}: {}",
            what,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{check_privileges, unique_ns_name};

    #[test]
    fn wrap_argv_prefixes_netns_exec() {
        let ns = Namespace {
            name: "hb_wrap".into(),
            deleted: true,
        };
        let argv = ns.wrap_argv(&["rsync".into(), "--version".into()]);
        assert_eq!(
            argv,
            ["ip", "netns", "exec", "hb_wrap", "rsync", "--version"]
        );
    }

    #[test]
    fn test_create_namespace_pair() {
        if !check_privileges() {
            eprintln!("Skipping test, unsufficient privileges or missing tools");
            return;
        }

        let ns1 = Namespace::new(&unique_ns_name("hb_a")).expect("Failed to create ns1");
        let _ns2 = Namespace::new(&unique_ns_name("hb_b")).expect("Failed to create ns2");

        let out1 = ns1.exec("ip", &["link"]).expect("Failed to exec ip link");
        let out1_str = String::from_utf8_lossy(&out1.stdout);
        assert!(out1_str.contains("lo"));
    }

    #[test]
    fn test_veth_link_and_delete() {
        if !check_privileges() {
            eprintln!("Skipping test, unsufficient privileges or missing tools");
            return;
        }

        let ns1 = Namespace::new(&unique_ns_name("hb_la")).expect("Failed to create ns1");
        let ns2 = Namespace::new(&unique_ns_name("hb_lb")).expect("Failed to create ns2");

        // Interface name limit is 15 chars.
        let suffix = std::process::id() % 100_000;
        let v_a = format!("veth_a_{}", suffix);
        let v_b = format!("veth_b_{}", suffix);

        ns1.add_veth_link(&ns2, &v_a, &v_b, "10.200.1.1/24", "10.200.1.2/24")
            .expect("Failed to create veth link");

        let out = ns1
            .exec("ping", &["-c", "1", "-W", "1", "10.200.1.2"])
            .expect("Failed to exec ping");
        assert!(
            out.status.success(),
            "Ping failed:\nStdout: {}\nStderr: {}",
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        );

        let name = ns2.name.clone();
        ns2.delete().expect("delete ns2");
        assert!(!exists(&name).unwrap());
    }
}
