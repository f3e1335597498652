//! Relay identity records and their deduplication.
//!
//! Relays show up in several places (consensus entries, circuit paths, family
//! lists, `ORCONN` targets), sometimes with a fingerprint, sometimes with only
//! a nickname. This module parses those references and merges records that
//! describe the same relay.
//!
//! # Identity Rule
//!
//! ```text
//!   A.fingerprint   B.fingerprint   same relay when
//!   ─────────────   ─────────────   ─────────────────────────────────────
//!   Some(x)         Some(y)         x == y
//!   Some(_)         None            nicknames match and addresses match
//!   None            None            nicknames match and addresses match
//! ```
//!
//! When two records merge, the fingerprint-bearing one wins every field it
//! has; the other only fills gaps.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::error::{Error, Result};

/// Length of a hex relay fingerprint.
pub const FINGERPRINT_LEN: usize = 40;

/// Returns `true` if `s` is a 40 character hex fingerprint, with or without a
/// leading `$`.
pub fn is_valid_fingerprint(s: &str) -> bool {
    let s = s.strip_prefix('$').unwrap_or(s);
    s.len() == FINGERPRINT_LEN && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// A reference to a relay as it appears in paths and family lists.
///
/// Accepted forms: `$FP`, `$FP~nick`, `$FP=nick`, `nick`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayRef {
    /// Uppercase hex fingerprint.
    pub fingerprint: Option<String>,
    /// Relay nickname.
    pub nickname: Option<String>,
}

impl RelayRef {
    /// Parses one path or family element.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an empty element or a `$` element
    /// whose fingerprint is not 40 hex characters.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Validation("empty relay reference".to_string()));
        }

        if let Some(rest) = s.strip_prefix('$') {
            let (fp, nick) = match rest.find(['~', '=']) {
                Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
                None => (rest, None),
            };
            if !is_valid_fingerprint(fp) {
                return Err(Error::Validation(format!("invalid fingerprint: {}", fp)));
            }
            return Ok(Self {
                fingerprint: Some(fp.to_ascii_uppercase()),
                nickname: nick.filter(|n| !n.is_empty()).map(str::to_string),
            });
        }

        if is_valid_fingerprint(s) {
            return Ok(Self {
                fingerprint: Some(s.to_ascii_uppercase()),
                nickname: None,
            });
        }

        Ok(Self {
            fingerprint: None,
            nickname: Some(s.to_string()),
        })
    }

    fn nickname_matches(&self, other: &RelayRef) -> bool {
        match (&self.nickname, &other.nickname) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }
}

impl std::fmt::Display for RelayRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.fingerprint, &self.nickname) {
            (Some(fp), Some(nick)) => write!(f, "${}~{}", fp, nick),
            (Some(fp), None) => write!(f, "${}", fp),
            (None, Some(nick)) => write!(f, "{}", nick),
            (None, None) => write!(f, "?"),
        }
    }
}

/// What is known about one relay.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RelayRecord {
    /// Uppercase hex fingerprint.
    pub fingerprint: Option<String>,
    /// Relay nickname.
    pub nickname: Option<String>,
    /// OR address.
    pub address: Option<IpAddr>,
    /// OR port.
    pub or_port: Option<u16>,
    /// Consensus flags (`Guard`, `Exit`, `Running`, ...).
    pub flags: Vec<String>,
    /// Declared family members.
    pub family: Vec<RelayRef>,
}

impl RelayRecord {
    /// Returns `true` if both records describe the same relay.
    pub fn same_relay(&self, other: &RelayRecord) -> bool {
        match (&self.fingerprint, &other.fingerprint) {
            (Some(a), Some(b)) => a == b,
            _ => {
                let nicks = match (&self.nickname, &other.nickname) {
                    (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                    _ => false,
                };
                nicks && self.address.is_some() && self.address == other.address
            }
        }
    }

    /// Merges `other` into `self` using fingerprint priority.
    ///
    /// If only `other` has a fingerprint its fields take precedence; otherwise
    /// `self`'s fields win and `other` fills the gaps.
    pub fn merge(&mut self, other: RelayRecord) {
        let (mut primary, secondary) = if self.fingerprint.is_none() && other.fingerprint.is_some()
        {
            (other, std::mem::take(self))
        } else {
            (std::mem::take(self), other)
        };

        if primary.nickname.is_none() {
            primary.nickname = secondary.nickname;
        }
        if primary.address.is_none() {
            primary.address = secondary.address;
        }
        if primary.or_port.is_none() {
            primary.or_port = secondary.or_port;
        }
        if primary.flags.is_empty() {
            primary.flags = secondary.flags;
        }
        for member in secondary.family {
            if !primary.family.contains(&member) {
                primary.family.push(member);
            }
        }

        *self = primary;
    }

    /// Returns `true` if the record carries the given consensus flag.
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    /// Reference form of this record.
    pub fn as_ref(&self) -> RelayRef {
        RelayRef {
            fingerprint: self.fingerprint.clone(),
            nickname: self.nickname.clone(),
        }
    }
}

/// Merges records that describe the same relay, keeping first-seen order.
pub fn dedup_relays(records: Vec<RelayRecord>) -> Vec<RelayRecord> {
    let mut merged: Vec<RelayRecord> = Vec::with_capacity(records.len());
    let mut by_fingerprint: HashMap<String, usize> = HashMap::new();
    let mut unfingerprinted = Vec::new();

    for record in records {
        match record.fingerprint.clone() {
            Some(fp) => match by_fingerprint.get(&fp) {
                Some(&idx) => merged[idx].merge(record),
                None => {
                    by_fingerprint.insert(fp, merged.len());
                    merged.push(record);
                }
            },
            None => unfingerprinted.push(record),
        }
    }

    for record in unfingerprinted {
        match merged.iter_mut().find(|m| m.same_relay(&record)) {
            Some(existing) => existing.merge(record),
            None => merged.push(record),
        }
    }

    merged
}

/// Deduplicates a family list.
///
/// Nickname-only members are first resolved to a fingerprint through the
/// consensus when exactly one relay carries that nickname. Members are then
/// deduplicated by fingerprint, and the rest by case-insensitive nickname.
pub fn dedup_family(members: &[RelayRef], consensus: &[RelayRecord]) -> Vec<RelayRef> {
    let mut nickname_index: HashMap<String, Option<&RelayRecord>> = HashMap::new();
    for relay in consensus {
        if let Some(ref nick) = relay.nickname {
            nickname_index
                .entry(nick.to_ascii_lowercase())
                .and_modify(|slot| *slot = None)
                .or_insert(Some(relay));
        }
    }

    let mut out: Vec<RelayRef> = Vec::with_capacity(members.len());
    for member in members {
        let mut member = member.clone();
        if member.fingerprint.is_none() {
            if let Some(nick) = member.nickname.as_ref() {
                if let Some(Some(relay)) = nickname_index.get(&nick.to_ascii_lowercase()) {
                    member.fingerprint = relay.fingerprint.clone();
                }
            }
        }

        let existing = out.iter_mut().find(|m| match (&m.fingerprint, &member.fingerprint) {
            (Some(a), Some(b)) => a == b,
            (None, None) => m.nickname_matches(&member),
            _ => false,
        });

        match existing {
            Some(m) => {
                if m.nickname.is_none() {
                    m.nickname = member.nickname;
                }
            }
            None => out.push(member),
        }
    }

    // A nickname-only leftover that names a fingerprinted member is that member.
    let named: Vec<RelayRef> = out
        .iter()
        .filter(|m| m.fingerprint.is_some())
        .cloned()
        .collect();
    out.retain(|m| m.fingerprint.is_some() || !named.iter().any(|n| n.nickname_matches(m)));
    out
}

/// Parses router status entries (`r`, `s`, `a` lines) from a network status
/// document, as carried by `NEWCONSENSUS` events and `GETINFO ns/all`.
///
/// Unparseable `r` lines are skipped along with the lines that follow them.
pub fn parse_router_statuses(body: &str) -> Vec<RelayRecord> {
    let mut relays = Vec::new();
    let mut current: Option<RelayRecord> = None;
    let mut skipping = false;

    for line in body.lines() {
        if let Some(rest) = line.strip_prefix("r ") {
            if let Some(relay) = current.take() {
                relays.push(relay);
            }
            current = parse_r_line(rest);
            skipping = current.is_none();
        } else if skipping {
            continue;
        } else if let Some(flags) = line.strip_prefix("s ") {
            if let Some(ref mut relay) = current {
                relay.flags = flags.split_whitespace().map(str::to_string).collect();
            }
        } else if line == "s" {
            if let Some(ref mut relay) = current {
                relay.flags.clear();
            }
        }
    }

    if let Some(relay) = current {
        relays.push(relay);
    }
    relays
}

// r nickname identity [digest] date time IP ORPort DirPort
fn parse_r_line(rest: &str) -> Option<RelayRecord> {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let (ip_idx, port_idx) = match parts.len() {
        n if n >= 8 => (5, 6),
        7 => (4, 5),
        _ => return None,
    };
    let fingerprint = decode_base64_fingerprint(parts[1])?;
    Some(RelayRecord {
        fingerprint: Some(fingerprint),
        nickname: Some(parts[0].to_string()),
        address: parts[ip_idx].parse().ok(),
        or_port: parts[port_idx].parse().ok(),
        flags: Vec::new(),
        family: Vec::new(),
    })
}

/// Decodes an unpadded base64 identity digest into an uppercase hex
/// fingerprint.
pub fn decode_base64_fingerprint(b64: &str) -> Option<String> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    let mut output = Vec::with_capacity(20);
    let mut buffer = 0u32;
    let mut bits = 0;

    for c in b64.trim_end_matches('=').bytes() {
        let value = ALPHABET.iter().position(|&x| x == c)? as u32;
        buffer = (buffer << 6) | value;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            output.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    if output.len() != FINGERPRINT_LEN / 2 {
        return None;
    }
    Some(hex::encode_upper(output))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FP_A: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
    const FP_B: &str = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";

    fn record(fp: Option<&str>, nick: &str, addr: &str) -> RelayRecord {
        RelayRecord {
            fingerprint: fp.map(str::to_string),
            nickname: Some(nick.to_string()),
            address: addr.parse().ok(),
            or_port: Some(9001),
            ..Default::default()
        }
    }

    #[test]
    fn test_relay_ref_forms() {
        let r = RelayRef::parse(&format!("${}~relay1", FP_A)).unwrap();
        assert_eq!(r.fingerprint.as_deref(), Some(FP_A));
        assert_eq!(r.nickname.as_deref(), Some("relay1"));

        let r = RelayRef::parse(&format!("${}=relay1", FP_A.to_lowercase())).unwrap();
        assert_eq!(r.fingerprint.as_deref(), Some(FP_A));

        let r = RelayRef::parse("relay2").unwrap();
        assert!(r.fingerprint.is_none());
        assert_eq!(r.to_string(), "relay2");

        assert!(RelayRef::parse("$ABC").is_err());
        assert!(RelayRef::parse("  ").is_err());
    }

    #[test]
    fn test_merge_prefers_fingerprint() {
        let records = vec![
            record(None, "relay1", "10.0.0.1"),
            record(Some(FP_A), "relay1", "10.0.0.1"),
        ];
        let merged = dedup_relays(records);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].fingerprint.as_deref(), Some(FP_A));
    }

    #[test]
    fn test_same_nickname_different_fingerprints_stay_apart() {
        let records = vec![
            record(Some(FP_A), "relay1", "10.0.0.1"),
            record(Some(FP_B), "relay1", "10.0.0.1"),
        ];
        assert_eq!(dedup_relays(records).len(), 2);
    }

    #[test]
    fn test_nickname_only_needs_same_address() {
        let records = vec![
            record(Some(FP_A), "relay1", "10.0.0.1"),
            record(None, "relay1", "10.0.0.2"),
        ];
        assert_eq!(dedup_relays(records).len(), 2);
    }

    #[test]
    fn test_merge_fills_gaps() {
        let mut a = record(None, "relay1", "10.0.0.1");
        a.flags = vec!["Guard".to_string()];
        let mut b = record(Some(FP_A), "relay1", "10.0.0.1");
        b.or_port = None;
        a.merge(b);
        assert_eq!(a.fingerprint.as_deref(), Some(FP_A));
        assert_eq!(a.or_port, Some(9001));
        assert!(a.has_flag("Guard"));
    }

    #[test]
    fn test_family_dedup_resolves_nicknames() {
        let consensus = vec![record(Some(FP_A), "relay1", "10.0.0.1")];
        let members = vec![
            RelayRef::parse(&format!("${}", FP_A)).unwrap(),
            RelayRef::parse("relay1").unwrap(),
            RelayRef::parse("Relay1").unwrap(),
            RelayRef::parse("other").unwrap(),
            RelayRef::parse("OTHER").unwrap(),
        ];
        let family = dedup_family(&members, &consensus);
        assert_eq!(family.len(), 2);
        assert_eq!(family[0].fingerprint.as_deref(), Some(FP_A));
        assert_eq!(family[0].nickname.as_deref(), Some("relay1"));
        assert_eq!(family[1].nickname.as_deref(), Some("other"));
    }

    #[test]
    fn test_family_ambiguous_nickname_stays_unresolved() {
        let consensus = vec![
            record(Some(FP_A), "twin", "10.0.0.1"),
            record(Some(FP_B), "twin", "10.0.0.2"),
        ];
        let members = vec![RelayRef::parse("twin").unwrap()];
        let family = dedup_family(&members, &consensus);
        assert_eq!(family.len(), 1);
        assert!(family[0].fingerprint.is_none());
    }

    #[test]
    fn test_parse_router_statuses() {
        let body = "r relay1 qqqqqqqqqqqqqqqqqqqqqqqqqqo digest 2024-01-01 00:00:00 10.0.0.1 9001 0\n\
                    s Fast Guard Running Valid\n\
                    r broken\n\
                    s Exit\n\
                    r relay2 u7u7u7u7u7u7u7u7u7u7u7u7u7s 2024-01-01 00:00:00 10.0.0.2 443 80\n\
                    s Exit Running";
        let relays = parse_router_statuses(body);
        assert_eq!(relays.len(), 2);
        assert_eq!(relays[0].nickname.as_deref(), Some("relay1"));
        assert_eq!(relays[0].fingerprint.as_deref(), Some(FP_A));
        assert_eq!(relays[0].address, Some("10.0.0.1".parse().unwrap()));
        assert!(relays[0].has_flag("Guard"));
        assert_eq!(relays[1].fingerprint.as_deref(), Some(FP_B));
        assert_eq!(relays[1].or_port, Some(443));
        assert!(relays[1].has_flag("Exit"));
    }

    #[test]
    fn test_decode_base64_fingerprint_rejects_short() {
        assert!(decode_base64_fingerprint("qqqq").is_none());
        assert!(decode_base64_fingerprint("!!!!").is_none());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn fingerprint() -> impl Strategy<Value = Option<String>> {
        prop::option::of(prop::sample::select(vec![
            "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string(),
            "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB".to_string(),
            "CCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCC".to_string(),
        ]))
    }

    fn relay() -> impl Strategy<Value = RelayRecord> {
        (
            fingerprint(),
            prop::sample::select(vec!["a", "b", "c"]),
            prop::sample::select(vec!["10.0.0.1", "10.0.0.2"]),
        )
            .prop_map(|(fp, nick, addr)| RelayRecord {
                fingerprint: fp,
                nickname: Some(nick.to_string()),
                address: addr.parse().ok(),
                ..Default::default()
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn dedup_leaves_unique_fingerprints(records in prop::collection::vec(relay(), 0..20)) {
            let merged = dedup_relays(records);
            let fps: Vec<_> = merged.iter().filter_map(|r| r.fingerprint.clone()).collect();
            let mut sorted = fps.clone();
            sorted.sort();
            sorted.dedup();
            prop_assert_eq!(fps.len(), sorted.len());
        }

        #[test]
        fn dedup_is_idempotent(records in prop::collection::vec(relay(), 0..20)) {
            let once = dedup_relays(records);
            let twice = dedup_relays(once.clone());
            prop_assert_eq!(once, twice);
        }
    }
}
