//! Operating system connection listing.
//!
//! Lists a process's established TCP connections with whichever tool the
//! platform provides, failing over between tools when one keeps failing.
//!
//! # Lookup Commands
//!
//! | Command | Invocation | Row (local, remote columns) |
//! |---------|------------|-----------------------------|
//! | `proc` | reads `/proc/net/tcp{,6}` | hex `addr:port`, state `01` |
//! | `netstat` | `netstat -np` | `tcp 0 0 L R ESTABLISHED 9912/tor` |
//! | `ss` | `ss -nptu` | `tcp ESTAB 0 0 L R users:(("tor",pid=9912,fd=20))` |
//! | `lsof` | `lsof -nPi` | `tor 3873 user 45u IPv4 40994 0t0 TCP L->R (ESTABLISHED)` |
//! | `sockstat` | `sockstat` | `user tor 3475 tcp4 L R ESTABLISHED` |
//! | `bsd-sockstat` | `sockstat -4c` | `user tor 3475 7 tcp4 L R` |
//! | `bsd-procstat` | `procstat -f <pid>` | columns 10 and 11, pid required |
//!
//! Rows are filtered in-process for the target name and pid, so no shell is
//! involved.
//!
//! # Failover
//!
//! ```text
//!   current command fails ──► failures += 1
//!        │                         │
//!        │                   failures == 3 ──► blacklist it, pick next option
//!        ▼                                       │
//!   success ──► failures = 0                     └─ none left ──► warn, give up
//! ```
//!
//! A forced command (`resolver_override`) never fails over.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;

use crate::config::LogLevel;
use crate::error::{Error, Result};
use crate::logger::plog;
use crate::resolver::ConnectionSource;

/// Consecutive failures before moving to another command.
pub const RESOLVER_FAILURE_TOLERANCE: u32 = 3;

/// An established TCP connection as the OS reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawConnection {
    /// Local endpoint.
    pub local: SocketAddr,
    /// Remote endpoint.
    pub remote: SocketAddr,
}

/// One output row: parsed, or kept verbatim when it could not be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawRow {
    /// A well-formed row.
    Parsed(RawConnection),
    /// A matching row whose addresses could not be read.
    Unparsed(String),
}

/// Connection lookup tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolverCommand {
    /// `/proc/net/tcp` and `/proc/net/tcp6`.
    Proc,
    /// `netstat -np`
    Netstat,
    /// `ss -nptu`
    Ss,
    /// `lsof -nPi`
    Lsof,
    /// `sockstat`
    Sockstat,
    /// FreeBSD `sockstat -4c`
    BsdSockstat,
    /// FreeBSD `procstat -f <pid>`
    BsdProcstat,
}

impl std::fmt::Display for ResolverCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResolverCommand::Proc => "proc",
            ResolverCommand::Netstat => "netstat",
            ResolverCommand::Ss => "ss",
            ResolverCommand::Lsof => "lsof",
            ResolverCommand::Sockstat => "sockstat",
            ResolverCommand::BsdSockstat => "sockstat (bsd)",
            ResolverCommand::BsdProcstat => "procstat (bsd)",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for ResolverCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proc" => Ok(ResolverCommand::Proc),
            "netstat" => Ok(ResolverCommand::Netstat),
            "ss" => Ok(ResolverCommand::Ss),
            "lsof" => Ok(ResolverCommand::Lsof),
            "sockstat" => Ok(ResolverCommand::Sockstat),
            "bsd-sockstat" | "sockstat (bsd)" => Ok(ResolverCommand::BsdSockstat),
            "bsd-procstat" | "procstat" | "procstat (bsd)" => Ok(ResolverCommand::BsdProcstat),
            _ => Err(Error::Config(format!("unknown connection resolver: {}", s))),
        }
    }
}

impl ResolverCommand {
    /// Commands worth trying on `os_type` (as from `uname -s`), best first.
    pub fn system_options(os_type: &str) -> Vec<ResolverCommand> {
        if os_type == "FreeBSD" {
            vec![
                ResolverCommand::BsdSockstat,
                ResolverCommand::BsdProcstat,
                ResolverCommand::Lsof,
            ]
        } else {
            vec![
                ResolverCommand::Proc,
                ResolverCommand::Netstat,
                ResolverCommand::Sockstat,
                ResolverCommand::Lsof,
                ResolverCommand::Ss,
            ]
        }
    }

    /// Program and arguments to run. `None` for [`ResolverCommand::Proc`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for procstat without a pid.
    pub fn invocation(&self, pid: Option<u32>) -> Result<Option<(&'static str, Vec<String>)>> {
        let args = |a: &[&str]| a.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Ok(Some(match self {
            ResolverCommand::Proc => return Ok(None),
            ResolverCommand::Netstat => ("netstat", args(&["-np"])),
            ResolverCommand::Ss => ("ss", args(&["-nptu"])),
            ResolverCommand::Lsof => ("lsof", args(&["-nPi"])),
            ResolverCommand::Sockstat => ("sockstat", Vec::new()),
            ResolverCommand::BsdSockstat => ("sockstat", args(&["-4c"])),
            ResolverCommand::BsdProcstat => {
                let pid = pid.ok_or_else(|| {
                    Error::Validation("procstat resolution requires a pid".to_string())
                })?;
                ("procstat", vec!["-f".to_string(), pid.to_string()])
            }
        }))
    }

    /// Returns `true` if the tool appears to be installed.
    pub fn is_available(&self) -> bool {
        match self.invocation(Some(1)) {
            Ok(Some((program, _))) => in_path(program),
            Ok(None) => Path::new("/proc/net/tcp").exists(),
            Err(_) => false,
        }
    }

    /// Returns `true` if `line` is an established connection belonging to
    /// the target. With no target, any established connection matches.
    pub fn matches(&self, line: &str, target: Option<(&str, Option<u32>)>) -> bool {
        let cols: Vec<&str> = line.split_whitespace().collect();
        let pid_ok = |p: &str, pid: Option<u32>| match pid {
            Some(pid) => p == pid.to_string(),
            None => !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()),
        };

        match self {
            ResolverCommand::Proc => true,
            ResolverCommand::Netstat => {
                let established = cols.get(5) == Some(&"ESTABLISHED");
                match target {
                    None => established,
                    Some((name, pid)) => {
                        established
                            && cols.get(6).and_then(|c| c.split_once('/')).is_some_and(
                                |(p, n)| n == name && pid_ok(p, pid),
                            )
                    }
                }
            }
            ResolverCommand::Ss => {
                let established = cols.iter().take(2).any(|c| *c == "ESTAB");
                match target {
                    None => established,
                    Some((name, pid)) => {
                        let quoted = format!("\"{}\",", name);
                        established
                            && line.contains(&quoted)
                            && match pid {
                                Some(pid) => {
                                    line.contains(&format!("pid={},", pid))
                                        || line.contains(&format!(",{},", pid))
                                }
                                None => true,
                            }
                    }
                }
            }
            ResolverCommand::Lsof => {
                let established = line.ends_with("(ESTABLISHED)");
                match target {
                    None => established,
                    Some((name, pid)) => {
                        established
                            && cols.first() == Some(&name)
                            && cols.get(1).is_some_and(|p| pid_ok(p, pid))
                    }
                }
            }
            ResolverCommand::Sockstat => {
                let established = line.contains("ESTABLISHED");
                match target {
                    None => established,
                    Some((name, pid)) => {
                        established
                            && cols.get(1) == Some(&name)
                            && cols.get(2).is_some_and(|p| pid_ok(p, pid))
                    }
                }
            }
            ResolverCommand::BsdSockstat => {
                let proto_ok = cols.get(4).is_some_and(|p| p.starts_with("tcp"));
                match target {
                    None => proto_ok,
                    Some((name, pid)) => {
                        proto_ok
                            && cols.get(1) == Some(&name)
                            && cols.get(2).is_some_and(|p| pid_ok(p, pid))
                    }
                }
            }
            ResolverCommand::BsdProcstat => line.contains("TCP") && !line.contains("0.0.0.0:0"),
        }
    }

    /// Parses a matching row.
    pub fn parse_row(&self, line: &str) -> RawRow {
        let cols: Vec<&str> = line.split_whitespace().collect();
        let pair = |l: usize, r: usize| -> Option<RawConnection> {
            Some(RawConnection {
                local: parse_socket_addr(cols.get(l)?)?,
                remote: parse_socket_addr(cols.get(r)?)?,
            })
        };

        let parsed = match self {
            ResolverCommand::Proc => parse_proc_net_line(line).map(|(conn, _)| conn),
            ResolverCommand::Netstat => pair(3, 4),
            ResolverCommand::Ss => {
                // Older ss omits the netid column.
                if cols.first().is_some_and(|c| *c == "ESTAB") {
                    pair(3, 4)
                } else {
                    pair(4, 5)
                }
            }
            ResolverCommand::Lsof => cols.get(8).and_then(|c| {
                let (l, r) = c.split_once("->")?;
                Some(RawConnection {
                    local: parse_socket_addr(l)?,
                    remote: parse_socket_addr(r)?,
                })
            }),
            ResolverCommand::Sockstat => pair(4, 5),
            ResolverCommand::BsdSockstat => pair(5, 6),
            ResolverCommand::BsdProcstat => pair(9, 10),
        };

        match parsed {
            Some(conn) => RawRow::Parsed(conn),
            None => RawRow::Unparsed(line.trim().to_string()),
        }
    }
}

fn in_path(program: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

/// Parses `ip:port`, `[v6]:port` and `v6:port` forms.
pub fn parse_socket_addr(s: &str) -> Option<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some(addr);
    }
    let (ip, port) = s.rsplit_once(':')?;
    let ip = ip.trim_start_matches('[').trim_end_matches(']');
    let ip: IpAddr = ip.split('%').next()?.parse().ok()?;
    Some(SocketAddr::new(ip, port.parse().ok()?))
}

/// Parses one `/proc/net/tcp{,6}` row, returning the connection and socket
/// inode. Only established rows (state `01`) parse.
pub fn parse_proc_net_line(line: &str) -> Option<(RawConnection, u64)> {
    let cols: Vec<&str> = line.split_whitespace().collect();
    if cols.get(3) != Some(&"01") {
        return None;
    }
    let local = parse_proc_addr(cols.get(1)?)?;
    let remote = parse_proc_addr(cols.get(2)?)?;
    let inode = cols.get(9)?.parse().ok()?;
    Some((RawConnection { local, remote }, inode))
}

fn parse_proc_addr(s: &str) -> Option<SocketAddr> {
    let (ip_hex, port_hex) = s.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let ip = match ip_hex.len() {
        8 => {
            let raw = u32::from_str_radix(ip_hex, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(raw.swap_bytes()))
        }
        32 => {
            let mut octets = [0u8; 16];
            for word in 0..4 {
                let raw = u32::from_str_radix(&ip_hex[word * 8..word * 8 + 8], 16).ok()?;
                octets[word * 4..word * 4 + 4].copy_from_slice(&raw.to_le_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

/// Runs external programs. Swappable for tests.
pub trait CommandRunner: Send {
    /// Runs `program` and returns its stdout lines.
    fn run(&self, program: &str, args: &[String]) -> Result<Vec<String>>;

    /// Reads a text file as lines.
    fn read_lines(&self, path: &Path) -> Result<Vec<String>> {
        Ok(std::fs::read_to_string(path)?
            .lines()
            .map(str::to_string)
            .collect())
    }

    /// Socket inodes held open by `pid`.
    fn socket_inodes(&self, pid: u32) -> Result<HashSet<u64>> {
        let mut inodes = HashSet::new();
        for entry in std::fs::read_dir(format!("/proc/{}/fd", pid))? {
            let target = match std::fs::read_link(entry?.path()) {
                Ok(target) => target,
                Err(_) => continue,
            };
            let target = target.to_string_lossy();
            if let Some(inode) = target
                .strip_prefix("socket:[")
                .and_then(|t| t.strip_suffix(']'))
                .and_then(|t| t.parse().ok())
            {
                inodes.insert(inode);
            }
        }
        Ok(inodes)
    }
}

/// Runs programs with [`std::process::Command`], discarding stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<Vec<String>> {
        let output = std::process::Command::new(program)
            .args(args)
            .stderr(std::process::Stdio::null())
            .output()?;
        if !output.status.success() && output.stdout.is_empty() {
            return Err(Error::Resolution(format!(
                "{} exited with {}",
                program, output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }
}

/// [`ConnectionSource`] backed by OS tools with failover.
pub struct SystemConnections {
    options: Vec<ResolverCommand>,
    forced: Option<ResolverCommand>,
    current: Option<ResolverCommand>,
    failures: u32,
    blacklist: Vec<ResolverCommand>,
    runner: Box<dyn CommandRunner>,
}

impl std::fmt::Debug for SystemConnections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemConnections")
            .field("options", &self.options)
            .field("forced", &self.forced)
            .field("current", &self.current)
            .field("failures", &self.failures)
            .finish()
    }
}

impl SystemConnections {
    /// Picks the first installed option for this platform.
    pub fn for_system(forced: Option<ResolverCommand>) -> Self {
        let os_type = if cfg!(target_os = "freebsd") {
            "FreeBSD"
        } else {
            std::env::consts::OS
        };
        let options = ResolverCommand::system_options(os_type);
        let labels: Vec<String> = options.iter().map(|o| o.to_string()).collect();
        plog(
            LogLevel::Info,
            &format!(
                "Operating System: {}, Connection Resolvers: {}",
                os_type,
                labels.join(", ")
            ),
        );

        let default = options
            .iter()
            .copied()
            .find(ResolverCommand::is_available)
            .or_else(|| options.first().copied());
        Self::with_runner(options, forced, default, Box::new(ProcessRunner))
    }

    /// Builds a source with explicit options and runner.
    pub fn with_runner(
        options: Vec<ResolverCommand>,
        forced: Option<ResolverCommand>,
        default: Option<ResolverCommand>,
        runner: Box<dyn CommandRunner>,
    ) -> Self {
        Self {
            current: default.or_else(|| options.first().copied()),
            options,
            forced,
            failures: 0,
            blacklist: Vec::new(),
            runner,
        }
    }

    /// Command that the next lookup will use.
    pub fn active(&self) -> Option<ResolverCommand> {
        self.forced.or(self.current)
    }

    fn lookup(&self, cmd: ResolverCommand, target: Option<(&str, Option<u32>)>) -> Result<Vec<RawRow>> {
        let pid = target.and_then(|(_, pid)| pid);

        let rows: Vec<RawRow> = match cmd.invocation(pid)? {
            None => {
                // Without a pid the table cannot be attributed to a process.
                if target.is_some() && pid.is_none() {
                    return Err(Error::Resolution(
                        "proc lookup by name requires a pid".to_string(),
                    ));
                }
                let inodes = match pid {
                    Some(pid) => Some(self.runner.socket_inodes(pid)?),
                    None => None,
                };
                let mut rows = Vec::new();
                for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
                    let lines = match self.runner.read_lines(Path::new(table)) {
                        Ok(lines) => lines,
                        Err(_) if table.ends_with('6') => continue,
                        Err(e) => return Err(e),
                    };
                    for line in lines.iter().skip(1) {
                        if let Some((conn, inode)) = parse_proc_net_line(line) {
                            if inodes.as_ref().is_none_or(|set| set.contains(&inode)) {
                                rows.push(RawRow::Parsed(conn));
                            }
                        }
                    }
                }
                rows
            }
            Some((program, args)) => self
                .runner
                .run(program, &args)?
                .iter()
                .filter(|line| cmd.matches(line, target))
                .map(|line| cmd.parse_row(line))
                .collect(),
        };

        if rows.is_empty() {
            return Err(Error::Resolution(format!("no results found using {}", cmd)));
        }
        Ok(rows)
    }

    fn record_failure(&mut self, cmd: ResolverCommand) {
        self.failures += 1;
        if self.failures < RESOLVER_FAILURE_TOLERANCE {
            return;
        }
        self.blacklist.push(cmd);
        self.failures = 0;
        self.current = self
            .options
            .iter()
            .copied()
            .find(|o| !self.blacklist.contains(o));
        match self.current {
            Some(next) => plog(
                LogLevel::Notice,
                &format!("Querying connections with {} failed, trying {}", cmd, next),
            ),
            None => plog(LogLevel::Warn, "All connection resolvers failed"),
        }
    }
}

impl ConnectionSource for SystemConnections {
    fn by_process(&mut self, name: &str, pid: Option<u32>) -> Result<Vec<RawRow>> {
        let cmd = self
            .active()
            .ok_or_else(|| Error::Resolution("all connection resolvers failed".to_string()))?;
        match self.lookup(cmd, Some((name, pid))) {
            Ok(rows) => {
                if self.forced.is_none() {
                    self.failures = 0;
                }
                Ok(rows)
            }
            Err(e) => {
                plog(LogLevel::Info, &e.to_string());
                if self.forced.is_none() {
                    self.record_failure(cmd);
                }
                Err(e)
            }
        }
    }

    fn all_established(&mut self) -> Result<Vec<RawRow>> {
        let mut last_err = Error::Resolution("no socket table source available".to_string());
        let mut candidates = vec![ResolverCommand::Proc];
        candidates.extend(self.active());
        for cmd in candidates {
            if cmd == ResolverCommand::BsdProcstat {
                continue;
            }
            match self.lookup(cmd, None) {
                Ok(rows) => return Ok(rows),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeRunner;
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_from_str() {
        assert_eq!("ss".parse::<ResolverCommand>().unwrap(), ResolverCommand::Ss);
        assert_eq!(
            "sockstat (bsd)".parse::<ResolverCommand>().unwrap(),
            ResolverCommand::BsdSockstat
        );
        assert!("telnet".parse::<ResolverCommand>().is_err());
    }

    #[test]
    fn test_procstat_requires_pid() {
        assert!(ResolverCommand::BsdProcstat.invocation(None).is_err());
        let (program, args) = ResolverCommand::BsdProcstat
            .invocation(Some(42))
            .unwrap()
            .unwrap();
        assert_eq!(program, "procstat");
        assert_eq!(args, vec!["-f".to_string(), "42".to_string()]);
    }

    #[test]
    fn test_netstat_row() {
        let line = "tcp        0      0 127.0.0.1:9051          127.0.0.1:53308         ESTABLISHED 9912/tor";
        let cmd = ResolverCommand::Netstat;
        assert!(cmd.matches(line, Some(("tor", Some(9912)))));
        assert!(cmd.matches(line, Some(("tor", None))));
        assert!(!cmd.matches(line, Some(("tor", Some(1)))));
        assert!(!cmd.matches(line, Some(("nginx", None))));
        assert_eq!(
            cmd.parse_row(line),
            RawRow::Parsed(RawConnection {
                local: addr("127.0.0.1:9051"),
                remote: addr("127.0.0.1:53308")
            })
        );
    }

    #[test]
    fn test_ss_row() {
        let line = "tcp   ESTAB  0  0  10.0.0.5:443  [::ffff:198.51.100.7]:50000  users:((\"tor\",pid=9912,fd=20))";
        let cmd = ResolverCommand::Ss;
        assert!(cmd.matches(line, Some(("tor", Some(9912)))));
        assert!(!cmd.matches(line, Some(("tor", Some(99)))));
        let RawRow::Parsed(conn) = cmd.parse_row(line) else {
            panic!("expected parsed row");
        };
        assert_eq!(conn.local, addr("10.0.0.5:443"));
        assert_eq!(conn.remote.port(), 50000);
    }

    #[test]
    fn test_lsof_row() {
        let line = "tor  3873  atagar  45u  IPv4  40994  0t0  TCP 10.243.55.20:45724->194.154.227.109:9001 (ESTABLISHED)";
        let cmd = ResolverCommand::Lsof;
        assert!(cmd.matches(line, Some(("tor", None))));
        assert_eq!(
            cmd.parse_row(line),
            RawRow::Parsed(RawConnection {
                local: addr("10.243.55.20:45724"),
                remote: addr("194.154.227.109:9001")
            })
        );
    }

    #[test]
    fn test_sockstat_rows() {
        let line = "atagar  tor  3475  tcp4  127.0.0.1:9051  127.0.0.1:38942  ESTABLISHED";
        assert!(ResolverCommand::Sockstat.matches(line, Some(("tor", Some(3475)))));
        assert!(matches!(
            ResolverCommand::Sockstat.parse_row(line),
            RawRow::Parsed(_)
        ));

        let bsd = "_tor     tor        4397  12 tcp4   172.27.72.202:54011   127.0.0.1:9001";
        assert!(ResolverCommand::BsdSockstat.matches(bsd, Some(("tor", Some(4397)))));
        assert_eq!(
            ResolverCommand::BsdSockstat.parse_row(bsd),
            RawRow::Parsed(RawConnection {
                local: addr("172.27.72.202:54011"),
                remote: addr("127.0.0.1:9001")
            })
        );
    }

    #[test]
    fn test_unparseable_row_kept() {
        let line = "tcp 0 0 *:9051 garbage ESTABLISHED 9912/tor";
        assert_eq!(
            ResolverCommand::Netstat.parse_row(line),
            RawRow::Unparsed(line.to_string())
        );
    }

    #[test]
    fn test_proc_net_lines() {
        let v4 = "   1: 0100007F:2353 0100007F:D0BC 01 00000000:00000000 00:00000000 00000000   107        0 1000 1 0000000000000000 20 4 30 10 -1";
        let (conn, inode) = parse_proc_net_line(v4).unwrap();
        assert_eq!(conn.local, addr("127.0.0.1:9043"));
        assert_eq!(conn.remote, addr("127.0.0.1:53436"));
        assert_eq!(inode, 1000);

        let listening = v4.replacen(" 01 ", " 0A ", 1);
        assert!(parse_proc_net_line(&listening).is_none());

        let v6 = "   0: 00000000000000000000000001000000:2353 00000000000000000000000001000000:D0BC 01 00000000:00000000 00:00000000 00000000 107 0 2000 1";
        let (conn, _) = parse_proc_net_line(v6).unwrap();
        assert_eq!(conn.local, addr("[::1]:9043"));
    }

    #[test]
    fn test_failover_after_three_failures() {
        let runner = FakeRunner::default();
        runner.set(
            "lsof",
            Ok(vec![
                "tor 1 u 4u IPv4 1 0t0 TCP 10.0.0.1:1000->10.0.0.2:9001 (ESTABLISHED)".to_string(),
            ]),
        );
        let mut source = SystemConnections::with_runner(
            vec![ResolverCommand::Netstat, ResolverCommand::Lsof],
            None,
            None,
            Box::new(runner.clone()),
        );

        for _ in 0..RESOLVER_FAILURE_TOLERANCE {
            assert_eq!(source.active(), Some(ResolverCommand::Netstat));
            assert!(source.by_process("tor", None).is_err());
        }
        assert_eq!(source.active(), Some(ResolverCommand::Lsof));
        assert_eq!(source.by_process("tor", None).unwrap().len(), 1);
    }

    #[test]
    fn test_all_resolvers_exhausted() {
        let mut source = SystemConnections::with_runner(
            vec![ResolverCommand::Netstat],
            None,
            None,
            Box::new(FakeRunner::default()),
        );
        for _ in 0..RESOLVER_FAILURE_TOLERANCE {
            assert!(source.by_process("tor", None).is_err());
        }
        assert_eq!(source.active(), None);
        assert!(matches!(
            source.by_process("tor", None),
            Err(Error::Resolution(_))
        ));
    }

    #[test]
    fn test_forced_command_never_fails_over() {
        let mut source = SystemConnections::with_runner(
            vec![ResolverCommand::Netstat, ResolverCommand::Lsof],
            Some(ResolverCommand::Ss),
            None,
            Box::new(FakeRunner::default()),
        );
        for _ in 0..5 {
            assert!(source.by_process("tor", None).is_err());
        }
        assert_eq!(source.active(), Some(ResolverCommand::Ss));
    }

    #[test]
    fn test_proc_lookup_filters_by_inode() {
        let runner = FakeRunner::default();
        runner.files.lock().unwrap().insert(
            "/proc/net/tcp".to_string(),
            vec![
                "  sl  local_address rem_address   st".to_string(),
                "   1: 0100007F:2353 0100007F:D0BC 01 0:0 0:0 0 107 0 1000 1".to_string(),
                "   2: 0100007F:2354 0100007F:D0BD 01 0:0 0:0 0 107 0 1001 1".to_string(),
            ],
        );
        let mut source = SystemConnections::with_runner(
            vec![ResolverCommand::Proc],
            None,
            None,
            Box::new(runner),
        );
        assert_eq!(source.by_process("tor", Some(7)).unwrap().len(), 1);
        assert_eq!(source.all_established().unwrap().len(), 2);
    }
}
