use crate::namespace::Namespace;
use crate::profile::ImpairmentProfile;
use std::io;
use std::time::Duration;

/// Shaping parameters for one side of a link, applied via `tc netem`.
///
/// All fields are optional: only non-`None` parameters are passed to netem.
/// If all fields are `None`, any existing qdisc is removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkShaping {
    pub rate_kbit: Option<u64>,
    pub delay: Option<Duration>,
    pub jitter: Option<Duration>,
    pub loss_percent: Option<f64>,
    /// Override the netem queue `limit` (in packets). When `None` and
    /// `rate_kbit` is set, a limit of ~2× the bandwidth-delay product is
    /// used so the queue stays finite.
    pub netem_limit: Option<u32>,
}

impl LinkShaping {
    /// Fixed access-link shaping: bandwidth and optional delay, no loss or
    /// jitter.
    pub fn fixed(rate_mbps: f64, delay: Option<Duration>) -> Self {
        Self {
            rate_kbit: Some(mbps_to_kbit(rate_mbps)),
            delay,
            ..Default::default()
        }
    }

    /// Shaping for the variable link, taken verbatim from `profile`.
    pub fn from_profile(profile: &ImpairmentProfile) -> Self {
        Self {
            rate_kbit: Some(mbps_to_kbit(profile.bandwidth_mbps)),
            delay: Some(profile.delay),
            jitter: (!profile.jitter.is_zero()).then_some(profile.jitter),
            loss_percent: (profile.loss_pct > 0.0).then_some(profile.loss_pct),
            netem_limit: None,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.netem_limit = Some(limit);
        self
    }

    fn is_empty(&self) -> bool {
        self.rate_kbit.is_none()
            && self.delay.is_none()
            && self.jitter.is_none()
            && self.loss_percent.is_none()
    }

    /// Queue limit actually installed, explicit or derived from the BDP.
    pub fn effective_limit(&self) -> Option<u32> {
        if let Some(explicit) = self.netem_limit {
            return Some(explicit);
        }
        let rate = self.rate_kbit?;
        // BDP-based auto limit: 2 × (rate × rtt) / MTU, minimum 20.
        let rtt_ms = self.delay.map(|d| d.as_millis() as u64).unwrap_or(20) * 2;
        let bdp_bytes = rate * 1000 / 8 * rtt_ms / 1000;
        let mtu = 1400u64;
        let bdp_packets = bdp_bytes / mtu;
        Some(std::cmp::max(bdp_packets as u32 * 2, 20))
    }
}

fn mbps_to_kbit(mbps: f64) -> u64 {
    ((mbps * 1000.0).round() as u64).max(1)
}

/// Applies `shaping` to `interface` inside `ns`, replacing any root qdisc.
pub fn apply_shaping(ns: &Namespace, interface: &str, shaping: &LinkShaping) -> io::Result<()> {
    // Remove existing qdisc (best effort) to start from a clean state
    let _ = ns.exec("tc", &["qdisc", "del", "dev", interface, "root"]);

    if shaping.is_empty() {
        return Ok(());
    }

    let args_storage = netem_args(interface, shaping);
    let args: Vec<&str> = args_storage.iter().map(|s| s.as_str()).collect();
    let output = ns.exec("tc", &args)?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "Failed to apply tc netem: {}\nCommand: tc {}",
            String::from_utf8_lossy(&output.stderr),
            args.join(" ")
        )));
    }
    tracing::debug!(ns = %ns.name, interface, command = %args.join(" "), "netem applied");
    Ok(())
}

/// Replaces the root qdisc of `interface` with `fq`, dropping any shaping.
pub fn apply_fq(ns: &Namespace, interface: &str) -> io::Result<()> {
    let _ = ns.exec("tc", &["qdisc", "del", "dev", interface, "root"]);
    ns.run("tc", &["qdisc", "add", "dev", interface, "root", "fq"])
}

/// Builds `qdisc add dev <iface> root netem [limit N] ...`.
pub fn netem_args(interface: &str, shaping: &LinkShaping) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "qdisc".into(),
        "add".into(),
        "dev".into(),
        interface.into(),
        "root".into(),
        "netem".into(),
    ];

    if let Some(lim) = shaping.effective_limit() {
        args.push("limit".into());
        args.push(lim.to_string());
    }

    // netem only accepts jitter as the second argument of delay
    if shaping.delay.is_some() || shaping.jitter.is_some() {
        args.push("delay".into());
        args.push(netem_time(shaping.delay.unwrap_or_default()));
        if let Some(jitter) = shaping.jitter.filter(|j| !j.is_zero()) {
            args.push(netem_time(jitter));
        }
    }

    if let Some(loss) = shaping.loss_percent {
        args.push("loss".into());
        args.push(format!("{}%", loss));
    }

    if let Some(rate) = shaping.rate_kbit {
        args.push("rate".into());
        args.push(format!("{}kbit", rate));
    }

    args
}

/// netem time value, in whole milliseconds when exact and microseconds
/// otherwise.
pub fn netem_time(d: Duration) -> String {
    let micros = d.as_micros();
    if micros % 1000 == 0 {
        format!("{}ms", micros / 1000)
    } else {
        format!("{micros}us")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{check_privileges, unique_ns_name};

    fn get_ping_time(output: &str) -> Option<f32> {
        // "64 bytes from 1.2.3.4: icmp_seq=1 ttl=64 time=102 ms"
        for line in output.lines() {
            if let Some(idx) = line.find("time=") {
                let rest = &line[idx + 5..];
                if let Some(end) = rest.find(' ') {
                    return rest[..end].parse::<f32>().ok();
                }
            }
        }
        None
    }

    #[test]
    fn profile_shaping_args() {
        let profile = ImpairmentProfile::new("jitter_5ms", 10.0, 20, 5, 0.5);
        let shaping = LinkShaping::from_profile(&profile).with_limit(200);
        assert_eq!(
            netem_args("r-eth3", &shaping).join(" "),
            "qdisc add dev r-eth3 root netem limit 200 delay 20ms 5ms loss 0.5% rate 10000kbit"
        );
    }

    #[test]
    fn sub_millisecond_times_keep_precision() {
        let profile = ImpairmentProfile {
            name: "fine".into(),
            bandwidth_mbps: 10.0,
            delay: Duration::from_micros(1500),
            jitter: Duration::from_micros(500),
            loss_pct: 0.0,
        };
        let args = netem_args("x", &LinkShaping::from_profile(&profile)).join(" ");
        assert!(args.contains("delay 1500us 500us"), "{args}");
        assert_eq!(netem_time(Duration::from_millis(20)), "20ms");
        assert_eq!(netem_time(Duration::ZERO), "0ms");
    }

    #[test]
    fn zero_jitter_and_loss_are_omitted() {
        let profile = ImpairmentProfile::new("baseline", 100.0, 10, 0, 0.0);
        let args = netem_args("h3-eth", &LinkShaping::from_profile(&profile)).join(" ");
        assert!(!args.contains("loss"));
        assert!(args.contains("delay 10ms rate 100000kbit"));
    }

    #[test]
    fn fixed_link_has_no_loss() {
        let shaping = LinkShaping::fixed(80.0, None);
        assert_eq!(shaping.rate_kbit, Some(80_000));
        assert_eq!(shaping.loss_percent, None);
        let args = netem_args("h2-eth", &shaping).join(" ");
        assert!(!args.contains("delay"));
        assert!(args.ends_with("rate 80000kbit"));
    }

    #[test]
    fn auto_limit_follows_bdp() {
        // 100 Mbit/s, 10 ms one-way: 250 kB BDP ≈ 178 packets, doubled
        let shaping = LinkShaping::fixed(100.0, Some(Duration::from_millis(10)));
        assert_eq!(shaping.effective_limit(), Some(356));
        // tiny links floor at 20 packets
        let slow = LinkShaping::fixed(0.1, Some(Duration::from_millis(1)));
        assert_eq!(slow.effective_limit(), Some(20));
    }

    #[test]
    fn test_delay_is_applied() {
        if !check_privileges() {
            eprintln!("Skipping test_delay_is_applied, insufficient privileges");
            return;
        }

        let ns1 = Namespace::new(&unique_ns_name("hb_imp_a")).expect("Failed to create ns1");
        let ns2 = Namespace::new(&unique_ns_name("hb_imp_b")).expect("Failed to create ns2");
        ns1.add_veth_link(&ns2, "hbveth_a", "hbveth_b", "10.201.1.1/24", "10.201.1.2/24")
            .expect("Failed to create link");

        let profile = ImpairmentProfile::new("delay_100ms", 5.0, 100, 0, 0.0);
        if let Err(err) = apply_shaping(&ns1, "hbveth_a", &LinkShaping::from_profile(&profile)) {
            if err.to_string().contains("qdisc kind is unknown") {
                eprintln!("Skipping test_delay_is_applied, netem qdisc not available");
                return;
            }
            panic!("Failed to apply shaping: {}", err);
        }

        let out = ns1
            .exec("ping", &["-c", "3", "-i", "0.2", "10.201.1.2"])
            .expect("Failed to exec ping");
        let stdout = String::from_utf8_lossy(&out.stdout);
        assert!(out.status.success(), "Ping failed: {}", stdout);

        let rtt = get_ping_time(&stdout).expect("Could not parse ping time");
        assert!(rtt >= 95.0, "RTT {} ms is less than expected delay 100ms", rtt);
    }
}
