//! Relay header facts: version, ports, authentication, flags and process
//! stats.
//!
//! Most values are static for the life of a session and are queried once per
//! connect. Two are cached in the [`StateStore`] with invalidation:
//!
//! | Cache key | Value | Invalidated by |
//! |-----------|-------|----------------|
//! | `bandwidth/limits` | [`BandwidthLimits`] | `CONF_CHANGED` |
//! | `relay/flags` | consensus flags | `NEWCONSENSUS` |
//!
//! # Effective Bandwidth
//!
//! `RelayBandwidthRate`/`RelayBandwidthBurst` take precedence over
//! `BandwidthRate`/`BandwidthBurst` when non-zero, and the advertised
//! bandwidth is additionally capped by `MaxAdvertisedBandwidth`.

use crate::config::LogLevel;
use crate::error::Result;
use crate::events::EventKind;
use crate::logger::plog;
use crate::relay::parse_router_statuses;
use crate::session::Session;
use crate::store::{Cached, StateStore};

/// Cache key for [`BandwidthLimits`].
pub const BANDWIDTH_KEY: &str = "bandwidth/limits";
/// Cache key for our consensus flags.
pub const FLAGS_KEY: &str = "relay/flags";

const BANDWIDTH_OPTIONS: [&str; 5] = [
    "BandwidthRate",
    "BandwidthBurst",
    "RelayBandwidthRate",
    "RelayBandwidthBurst",
    "MaxAdvertisedBandwidth",
];

/// Parses a Tor bandwidth value such as `1073741824`, `5 MB` or `100 KBytes`
/// into bytes per second.
pub fn parse_bytes(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: u64 = number.parse().ok()?;
    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" | "byte" | "bytes" => 1,
        "kb" | "kbyte" | "kbytes" | "kilobyte" | "kilobytes" => 1 << 10,
        "mb" | "mbyte" | "mbytes" | "megabyte" | "megabytes" => 1 << 20,
        "gb" | "gbyte" | "gbytes" | "gigabyte" | "gigabytes" => 1 << 30,
        "tb" | "tbyte" | "tbytes" | "terabyte" | "terabytes" => 1 << 40,
        _ => return None,
    };
    number.checked_mul(multiplier)
}

/// Bandwidth limits in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BandwidthLimits {
    /// Effective sustained rate.
    pub rate: u64,
    /// Effective burst.
    pub burst: u64,
    /// `MaxAdvertisedBandwidth`, when set.
    pub max_advertised: Option<u64>,
}

impl BandwidthLimits {
    /// Applies the relay-over-general precedence to `GETCONF` values.
    pub fn from_conf(values: &[(String, Option<String>)]) -> Self {
        let get = |key: &str| -> u64 {
            values
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .and_then(|(_, v)| v.as_deref())
                .and_then(parse_bytes)
                .unwrap_or(0)
        };

        let pick = |relay: u64, general: u64| if relay > 0 { relay } else { general };
        let max_advertised = get("MaxAdvertisedBandwidth");
        Self {
            rate: pick(get("RelayBandwidthRate"), get("BandwidthRate")),
            burst: pick(get("RelayBandwidthBurst"), get("BandwidthBurst")),
            max_advertised: (max_advertised > 0).then_some(max_advertised),
        }
    }

    /// Bandwidth the relay advertises.
    pub fn advertised(&self) -> u64 {
        match self.max_advertised {
            Some(cap) => self.rate.min(cap),
            None => self.rate,
        }
    }
}

/// Read-through accessor for the effective bandwidth.
///
/// Returns the cached value while fresh, otherwise queries Tor and caches
/// the result until the next `CONF_CHANGED`.
pub async fn effective_bandwidth(session: &Session, store: &StateStore) -> Result<Cached<BandwidthLimits>> {
    if let Some(cached) = store.get::<BandwidthLimits>(BANDWIDTH_KEY) {
        if !cached.stale {
            return Ok(cached);
        }
    }

    let ticket = store.ticket(&[EventKind::ConfChanged]);
    let values = session.get_conf(&BANDWIDTH_OPTIONS).await?;
    let limits = BandwidthLimits::from_conf(&values);
    Ok(store.put_if_unchanged(BANDWIDTH_KEY, limits, &[EventKind::ConfChanged], &ticket))
}

/// Read-through accessor for our consensus flags.
pub async fn relay_flags(session: &Session, store: &StateStore, fingerprint: &str) -> Result<Cached<Vec<String>>> {
    if let Some(cached) = store.get::<Vec<String>>(FLAGS_KEY) {
        if !cached.stale {
            return Ok(cached);
        }
    }

    let ticket = store.ticket(&[EventKind::NewConsensus]);
    let body = session.get_info(&format!("ns/id/{}", fingerprint)).await?;
    let flags = parse_router_statuses(&body)
        .into_iter()
        .next()
        .map(|r| r.flags)
        .unwrap_or_default();
    Ok(store.put_if_unchanged(FLAGS_KEY, flags, &[EventKind::NewConsensus], &ticket))
}

/// How controllers authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthType {
    /// No authentication.
    #[default]
    Open,
    /// `HashedControlPassword`.
    Password,
    /// `CookieAuthentication`.
    Cookie,
}

impl std::fmt::Display for AuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthType::Open => write!(f, "open"),
            AuthType::Password => write!(f, "password"),
            AuthType::Cookie => write!(f, "cookie"),
        }
    }
}

/// Resource usage from `ps -p <pid> -o %cpu,rss,%mem,etime`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PsStats {
    /// CPU percentage.
    pub cpu: f64,
    /// Resident memory in KiB.
    pub rss_kb: u64,
    /// Memory percentage.
    pub mem: f64,
    /// Elapsed time as `ps` prints it.
    pub etime: String,
}

impl PsStats {
    /// Parses `ps` output: a header line followed by one row of four values.
    ///
    /// ```text
    /// %CPU   RSS %MEM     ELAPSED
    ///  0.3 14096  1.3       29:51
    /// ```
    pub fn parse(output: &str) -> Option<PsStats> {
        let row = output.lines().nth(1)?;
        let cols: Vec<&str> = row.split_whitespace().collect();
        if cols.len() != 4 {
            return None;
        }
        Some(PsStats {
            cpu: cols[0].parse().ok()?,
            rss_kb: cols[1].parse().ok()?,
            mem: cols[2].parse().ok()?,
            etime: cols[3].to_string(),
        })
    }

    /// Samples the process. Returns `None` if `ps` fails, most likely
    /// because the process is gone.
    pub fn query(pid: u32) -> Option<PsStats> {
        let output = std::process::Command::new("ps")
            .args(["-p", &pid.to_string(), "-o", "%cpu,rss,%mem,etime"])
            .stderr(std::process::Stdio::null())
            .output()
            .ok()?;
        Self::parse(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Header facts about the monitored relay.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RelayStatus {
    /// Tor version without the git suffix, e.g. `0.4.8.12`.
    pub version: String,
    /// `status/version/current`: `recommended`, `obsolete`, ...
    pub version_status: String,
    /// Relay nickname.
    pub nickname: String,
    /// External address.
    pub address: Option<String>,
    /// ORPort.
    pub or_port: Option<u16>,
    /// DirPort.
    pub dir_port: Option<u16>,
    /// ControlPort.
    pub control_port: Option<u16>,
    /// Controller authentication.
    pub auth_type: AuthType,
    /// Exit policy entries joined with `, `. Empty for the default policy.
    pub exit_policy: String,
    /// Our fingerprint. Clients have none.
    pub fingerprint: Option<String>,
    /// Our consensus flags.
    pub flags: Vec<String>,
    /// Tor's pid.
    pub pid: Option<u32>,
    /// Latest `ps` sample.
    pub ps: Option<PsStats>,
}

fn parse_port(value: Option<&str>) -> Option<u16> {
    let first = value?.split_whitespace().next()?;
    let port = first.rsplit(':').next()?;
    port.parse().ok().filter(|p| *p != 0)
}

impl RelayStatus {
    /// Queries every header fact. Lookups Tor refuses (a client has no
    /// fingerprint, old Tors lack `ORListenAddress`) leave the field unset.
    ///
    /// # Errors
    ///
    /// Fails only if the session itself fails or `GETCONF` of the basic
    /// options is rejected.
    pub async fn query(session: &Session, store: &StateStore) -> Result<RelayStatus> {
        let mut status = RelayStatus {
            version: optional(session.get_info("version").await)
                .and_then(|v| v.split_whitespace().next().map(str::to_string))
                .unwrap_or_else(|| "Unknown".to_string()),
            version_status: optional(session.get_info("status/version/current").await)
                .unwrap_or_else(|| "Unknown".to_string()),
            ..Default::default()
        };

        let conf = session
            .get_conf(&[
                "Nickname",
                "ORPort",
                "DirPort",
                "ControlPort",
                "HashedControlPassword",
                "CookieAuthentication",
                "ExitPolicy",
            ])
            .await?;
        let value = |key: &str| {
            conf.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .and_then(|(_, v)| v.as_deref())
        };

        status.nickname = value("Nickname").unwrap_or_default().to_string();
        status.or_port = parse_port(value("ORPort"));
        status.dir_port = parse_port(value("DirPort"));
        status.control_port = parse_port(value("ControlPort"));
        status.auth_type = if value("HashedControlPassword").is_some_and(|v| !v.is_empty()) {
            AuthType::Password
        } else if value("CookieAuthentication") == Some("1") {
            AuthType::Cookie
        } else {
            AuthType::Open
        };
        status.exit_policy = conf
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("ExitPolicy"))
            .filter_map(|(_, v)| v.as_deref())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(", ");

        if let Some(listen) = optional(session.get_conf_value("ORListenAddress").await).flatten() {
            match listen.rsplit_once(':') {
                Some((addr, port)) => {
                    status.address = Some(addr.to_string());
                    status.or_port = port.parse().ok().or(status.or_port);
                }
                None => status.address = Some(listen),
            }
        }
        if status.address.is_none() {
            status.address = optional(session.get_info("address").await);
        }

        status.fingerprint = optional(session.get_info("fingerprint").await);
        if let Some(fp) = status.fingerprint.clone() {
            if let Some(flags) = optional(relay_flags(session, store, &fp).await) {
                status.flags = flags.value;
            }
        }

        status.pid = optional(session.get_info("process/pid").await).and_then(|p| p.trim().parse().ok());
        Ok(status)
    }
}

fn optional<T>(result: Result<T>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            plog(LogLevel::Debug, &format!("optional query failed: {}", e));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::session::testing::pair;
    use crate::session::{Credentials, COOKIE_LEN};
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    const BANDWIDTH_GETCONF: &str = "GETCONF BandwidthRate BandwidthBurst RelayBandwidthRate RelayBandwidthBurst MaxAdvertisedBandwidth";

    fn conf(pairs: &[(&str, Option<&str>)]) -> Vec<(String, Option<String>)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect()
    }

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_bytes("1073741824"), Some(1 << 30));
        assert_eq!(parse_bytes("5 MB"), Some(5 << 20));
        assert_eq!(parse_bytes("100 KBytes"), Some(100 << 10));
        assert_eq!(parse_bytes("7 furlongs"), None);
        assert_eq!(parse_bytes(""), None);
    }

    #[test]
    fn test_relay_bandwidth_takes_precedence() {
        let limits = BandwidthLimits::from_conf(&conf(&[
            ("BandwidthRate", Some("1000")),
            ("BandwidthBurst", Some("2000")),
            ("RelayBandwidthRate", Some("500")),
            ("RelayBandwidthBurst", Some("0")),
            ("MaxAdvertisedBandwidth", Some("300")),
        ]));
        assert_eq!(limits.rate, 500);
        assert_eq!(limits.burst, 2000);
        assert_eq!(limits.advertised(), 300);

        let plain = BandwidthLimits::from_conf(&conf(&[
            ("BandwidthRate", Some("1000")),
            ("MaxAdvertisedBandwidth", None),
        ]));
        assert_eq!(plain.rate, 1000);
        assert_eq!(plain.advertised(), 1000);
    }

    #[test]
    fn test_ps_parse() {
        let out = "%CPU   RSS %MEM     ELAPSED\n 0.3 14096  1.3       29:51\n";
        let stats = PsStats::parse(out).unwrap();
        assert_eq!(stats.rss_kb, 14096);
        assert_eq!(stats.etime, "29:51");
        assert!((stats.cpu - 0.3).abs() < 1e-9);

        assert!(PsStats::parse("%CPU   RSS %MEM     ELAPSED\n").is_none());
        assert!(PsStats::parse("%CPU RSS\n 0.3 x 1.3 1:00\n").is_none());
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port(Some("9001")), Some(9001));
        assert_eq!(parse_port(Some("0")), None);
        assert_eq!(parse_port(Some("[::]:443 NoAdvertise")), Some(443));
        assert_eq!(parse_port(Some("auto")), None);
        assert_eq!(parse_port(None), None);
    }

    #[tokio::test]
    async fn test_conf_change_invalidates_cached_bandwidth() {
        let mut cookie = NamedTempFile::new().unwrap();
        cookie.write_all(&[0x01; COOKIE_LEN]).unwrap();
        let path = cookie.path().to_path_buf();

        let (session, mut tor) = pair();
        let session = Arc::new(session);
        let mut events = session.events().unwrap();
        let store = StateStore::new();

        let s = session.clone();
        let auth = tokio::spawn(async move { s.authenticate(Credentials::CookieFile(path)).await });
        tor.protocolinfo("COOKIE", Some("/run/tor/control.authcookie"))
            .await;
        assert_eq!(
            tor.expect_line().await,
            format!("AUTHENTICATE {}", "01".repeat(COOKIE_LEN))
        );
        tor.send(&["250 OK"]).await;
        auth.await.unwrap().unwrap();

        let (s, st) = (session.clone(), store.clone());
        let first = tokio::spawn(async move { effective_bandwidth(&s, &st).await });
        assert_eq!(tor.expect_line().await, BANDWIDTH_GETCONF);
        tor.send(&[
            "250-BandwidthRate=1000",
            "250-BandwidthBurst=2000",
            "250-RelayBandwidthRate=0",
            "250-RelayBandwidthBurst=0",
            "250 MaxAdvertisedBandwidth=1073741824",
        ])
        .await;
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.value.rate, 1000);
        assert!(!first.stale);

        // Fresh entries are served without a query.
        let cached = effective_bandwidth(&session, &store).await.unwrap();
        assert_eq!(cached.value, first.value);

        let s = session.clone();
        let set = tokio::spawn(async move { s.set_conf(&[("RelayBandwidthRate", "500")]).await });
        assert_eq!(tor.expect_line().await, "SETCONF RelayBandwidthRate=\"500\"");
        tor.send(&["250 OK"]).await;
        set.await.unwrap().unwrap();

        let event = events.next().await.unwrap();
        assert_eq!(event.kind(), EventKind::ConfChanged);
        store.on_event(&event);
        let stale = store.get::<BandwidthLimits>(BANDWIDTH_KEY).unwrap();
        assert!(stale.stale);
        assert_eq!(stale.value.rate, 1000);

        let (s, st) = (session.clone(), store.clone());
        let second = tokio::spawn(async move { effective_bandwidth(&s, &st).await });
        assert_eq!(tor.expect_line().await, BANDWIDTH_GETCONF);
        tor.send(&[
            "250-BandwidthRate=1000",
            "250-BandwidthBurst=2000",
            "250-RelayBandwidthRate=500",
            "250-RelayBandwidthBurst=0",
            "250 MaxAdvertisedBandwidth=1073741824",
        ])
        .await;
        let second = second.await.unwrap().unwrap();
        assert_eq!(second.value.rate, 500);
        assert!(!second.stale);
        assert!(!store.get::<BandwidthLimits>(BANDWIDTH_KEY).unwrap().stale);
    }

    #[tokio::test]
    async fn test_conf_change_during_query_keeps_entry_stale() {
        let (session, mut tor) = pair();
        let session = Arc::new(session);
        let store = StateStore::new();

        let (s, st) = (session.clone(), store.clone());
        let query = tokio::spawn(async move { effective_bandwidth(&s, &st).await });
        assert_eq!(tor.expect_line().await, BANDWIDTH_GETCONF);

        store.on_event(&Event::ConfChanged(vec![(
            "BandwidthRate".to_string(),
            Some("5000".to_string()),
        )]));
        tor.send(&[
            "250-BandwidthRate=1000",
            "250-BandwidthBurst=2000",
            "250-RelayBandwidthRate=0",
            "250-RelayBandwidthBurst=0",
            "250 MaxAdvertisedBandwidth=1073741824",
        ])
        .await;
        let answer = query.await.unwrap().unwrap();
        assert_eq!(answer.value.rate, 1000);
        assert!(answer.stale);
        assert!(store.get::<BandwidthLimits>(BANDWIDTH_KEY).unwrap().stale);

        // The next read asks Tor again and picks up the new value.
        let (s, st) = (session.clone(), store.clone());
        let again = tokio::spawn(async move { effective_bandwidth(&s, &st).await });
        assert_eq!(tor.expect_line().await, BANDWIDTH_GETCONF);
        tor.send(&[
            "250-BandwidthRate=5000",
            "250-BandwidthBurst=5000",
            "250-RelayBandwidthRate=0",
            "250-RelayBandwidthBurst=0",
            "250 MaxAdvertisedBandwidth=1073741824",
        ])
        .await;
        let again = again.await.unwrap().unwrap();
        assert_eq!(again.value.rate, 5000);
        assert!(!again.stale);
    }

    #[tokio::test]
    async fn test_relay_status_query() {
        let (session, mut tor) = pair();
        let session = Arc::new(session);
        let store = StateStore::new();

        let (s, st) = (session.clone(), store.clone());
        let query = tokio::spawn(async move { RelayStatus::query(&s, &st).await });

        assert_eq!(tor.expect_line().await, "GETINFO version");
        tor.send(&["250-version=0.4.8.12 (git-0123456789abcdef)", "250 OK"]).await;
        assert_eq!(tor.expect_line().await, "GETINFO status/version/current");
        tor.send(&["250-status/version/current=recommended", "250 OK"]).await;
        assert_eq!(
            tor.expect_line().await,
            "GETCONF Nickname ORPort DirPort ControlPort HashedControlPassword CookieAuthentication ExitPolicy"
        );
        tor.send(&[
            "250-Nickname=caerSidi",
            "250-ORPort=9001",
            "250-DirPort=0",
            "250-ControlPort=9051",
            "250-HashedControlPassword",
            "250-CookieAuthentication=1",
            "250-ExitPolicy=reject *:25,reject *:119",
            "250 ExitPolicy=accept *:*",
        ])
        .await;
        assert_eq!(tor.expect_line().await, "GETCONF ORListenAddress");
        tor.send(&["552 Unrecognized configuration key \"ORListenAddress\""]).await;
        assert_eq!(tor.expect_line().await, "GETINFO address");
        tor.send(&["250-address=203.0.113.9", "250 OK"]).await;
        assert_eq!(tor.expect_line().await, "GETINFO fingerprint");
        tor.send(&["250-fingerprint=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA", "250 OK"]).await;
        assert_eq!(
            tor.expect_line().await,
            "GETINFO ns/id/AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"
        );
        tor.send(&[
            "250+ns/id/AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=",
            "r caerSidi qqqqqqqqqqqqqqqqqqqqqqqqqqo u7u7u7u7u7u7u7u7u7u7u7u7u7s 2024-01-01 00:00:00 203.0.113.9 9001 0",
            "s Fast Guard Running Stable Valid",
            ".",
            "250 OK",
        ])
        .await;
        assert_eq!(tor.expect_line().await, "GETINFO process/pid");
        tor.send(&["250-process/pid=4242", "250 OK"]).await;

        let status = query.await.unwrap().unwrap();
        assert_eq!(status.version, "0.4.8.12");
        assert_eq!(status.version_status, "recommended");
        assert_eq!(status.nickname, "caerSidi");
        assert_eq!(status.or_port, Some(9001));
        assert_eq!(status.dir_port, None);
        assert_eq!(status.control_port, Some(9051));
        assert_eq!(status.auth_type, AuthType::Cookie);
        assert_eq!(status.exit_policy, "reject *:25, reject *:119, accept *:*");
        assert_eq!(status.address.as_deref(), Some("203.0.113.9"));
        assert!(status.flags.contains(&"Guard".to_string()));
        assert_eq!(status.pid, Some(4242));

        let cached = store.get::<Vec<String>>(FLAGS_KEY).unwrap();
        assert!(!cached.stale);
        store.on_event(&crate::events::Event::NewConsensus(Vec::new()));
        assert!(store.get::<Vec<String>>(FLAGS_KEY).unwrap().stale);
    }
}
