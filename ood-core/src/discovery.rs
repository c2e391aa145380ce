//! Vehicle discovery bookkeeping: de-duplicated, sorted, self-pruning device list,
//! plus display-name resolution from advertisement data.

use std::collections::HashMap;

use serde::Serialize;

/// Expected spacing of scan results.
pub const SCAN_RESULT_CADENCE_MS: i64 = 2000;
/// A device unseen for this long is dropped.
pub const DEFAULT_STALE_AFTER_MS: i64 = 3 * SCAN_RESULT_CADENCE_MS;

/// Byte offset of the model id inside the vendor manufacturer data
/// (`identifier: u32 | model_id: u8 | reserved: u8 | product_id: u16`).
const MFG_MODEL_ID_OFFSET: usize = 4;

/// Raw scan result handed over by the radio collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    pub address: String,
    pub local_name: Option<String>,
    pub manufacturer_data: Option<Vec<u8>>,
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub address: String,
    pub display_name: Option<String>,
    pub signal_strength: Option<i16>,
}

/// Known vehicle model ids.
pub fn model_name(model_id: u8) -> Option<&'static str> {
    let name = match model_id {
        1 => "Kourai",
        2 => "Boson",
        3 => "Rho",
        4 => "Katal",
        5 => "Hadion",
        6 => "Spektrix",
        7 => "Corax",
        8 => "Groundshock",
        9 => "Skull",
        10 => "Thermo",
        11 => "Nuke",
        12 => "Guardian",
        14 => "Bigbang",
        15 => "Free Wheel",
        16 => "X52",
        17 => "X52 Ice",
        18 => "MXT",
        19 => "Ice Charger",
        _ => return None,
    };
    Some(name)
}

/// Best-effort filter for advertised names garbled by some receivers: a short,
/// non-alphabetic prefix glued to a known suffix token (e.g. `"\u{1}0Drive"`).
/// Tunable; it can misclassify legitimate short names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameHeuristic {
    pub suffix_tokens: Vec<String>,
    pub max_prefix_len: usize,
}

impl Default for NameHeuristic {
    fn default() -> Self {
        Self {
            suffix_tokens: vec!["Drive".to_string(), "Overdrive".to_string()],
            max_prefix_len: 3,
        }
    }
}

impl NameHeuristic {
    pub fn is_corrupted(&self, name: &str) -> bool {
        self.suffix_tokens.iter().any(|token| {
            let Some(prefix) = name.strip_suffix(token.as_str()) else {
                return false;
            };
            let count = prefix.chars().count();
            count > 0
                && count <= self.max_prefix_len
                && !prefix.chars().any(char::is_alphabetic)
        })
    }

    /// Model table first, then the advertised name if it looks sane, else `None`
    /// (the caller shows the address).
    pub fn resolve(&self, adv: &Advertisement) -> Option<String> {
        let model = adv
            .manufacturer_data
            .as_deref()
            .and_then(|d| d.get(MFG_MODEL_ID_OFFSET).copied())
            .and_then(model_name);
        if let Some(name) = model {
            return Some(name.to_string());
        }
        adv.local_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty() && !self.is_corrupted(n))
            .map(str::to_string)
    }
}

struct Entry {
    device: DiscoveredDevice,
    last_seen_ms: i64,
}

/// Devices seen within the trailing window, keyed by address.
pub struct DeviceTable {
    entries: HashMap<String, Entry>,
    stale_after_ms: i64,
    names: NameHeuristic,
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER_MS, NameHeuristic::default())
    }
}

impl DeviceTable {
    pub fn new(stale_after_ms: i64, names: NameHeuristic) -> Self {
        Self {
            entries: HashMap::new(),
            stale_after_ms,
            names,
        }
    }

    /// Insert or refresh a device. A later advertisement without a resolvable
    /// name keeps the name resolved earlier.
    pub fn observe(&mut self, adv: &Advertisement, now_ms: i64) {
        let resolved = self.names.resolve(adv);
        let entry = self
            .entries
            .entry(adv.address.clone())
            .or_insert_with(|| Entry {
                device: DiscoveredDevice {
                    address: adv.address.clone(),
                    display_name: None,
                    signal_strength: None,
                },
                last_seen_ms: now_ms,
            });
        if resolved.is_some() {
            entry.device.display_name = resolved;
        }
        if adv.rssi.is_some() {
            entry.device.signal_strength = adv.rssi;
        }
        entry.last_seen_ms = now_ms;
    }

    /// Drop entries not observed within the window. Returns true if anything was removed.
    pub fn prune(&mut self, now_ms: i64) -> bool {
        let before = self.entries.len();
        let stale_after = self.stale_after_ms;
        self.entries
            .retain(|_, e| now_ms - e.last_seen_ms <= stale_after);
        self.entries.len() != before
    }

    /// Sorted by display name (address when unnamed), address as tiebreak.
    pub fn snapshot(&self) -> Vec<DiscoveredDevice> {
        let mut out: Vec<DiscoveredDevice> = self.entries.values().map(|e| e.device.clone()).collect();
        out.sort_by(|a, b| {
            let ka = a.display_name.as_deref().unwrap_or(&a.address);
            let kb = b.display_name.as_deref().unwrap_or(&b.address);
            ka.cmp(kb).then_with(|| a.address.cmp(&b.address))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adv(address: &str, name: Option<&str>, model: Option<u8>) -> Advertisement {
        Advertisement {
            address: address.to_string(),
            local_name: name.map(str::to_string),
            manufacturer_data: model.map(|m| vec![0xBE, 0xEF, 0x00, 0x00, m, 0x00, 0x01, 0x00]),
            rssi: Some(-60),
        }
    }

    #[test]
    fn model_id_wins_over_advertised_name() {
        let names = NameHeuristic::default();
        assert_eq!(names.resolve(&adv("A", Some("Drive"), Some(10))), Some("Thermo".into()));
        assert_eq!(names.resolve(&adv("A", Some("My Car"), Some(99))), Some("My Car".into()));
    }

    #[test]
    fn corrupted_names_are_dropped() {
        let names = NameHeuristic::default();
        assert!(names.is_corrupted("\u{1}0Drive"));
        assert!(names.is_corrupted("12 Drive"));
        assert!(!names.is_corrupted("Drive"));
        assert!(!names.is_corrupted("MyDrive"));
        assert!(!names.is_corrupted("1234Drive"));
        assert_eq!(names.resolve(&adv("A", Some("#0Drive"), None)), None);
        assert_eq!(names.resolve(&adv("A", Some("   "), None)), None);
    }

    #[test]
    fn heuristic_is_tunable() {
        let names = NameHeuristic {
            suffix_tokens: vec!["Car".into()],
            max_prefix_len: 1,
        };
        assert!(names.is_corrupted("7Car"));
        assert!(!names.is_corrupted("77Car"));
        assert!(!names.is_corrupted("0Drive"));
    }

    #[test]
    fn dedupes_and_sorts() {
        let mut t = DeviceTable::default();
        t.observe(&adv("CC", None, Some(2)), 0);
        t.observe(&adv("AA", None, Some(4)), 0);
        t.observe(&adv("BB", None, None), 0);
        t.observe(&adv("DD", None, Some(2)), 0);
        t.observe(&adv("AA", None, Some(4)), 100);
        let names: Vec<(Option<String>, String)> = t
            .snapshot()
            .into_iter()
            .map(|d| (d.display_name, d.address))
            .collect();
        assert_eq!(
            names,
            vec![
                (None, "BB".into()),
                (Some("Boson".into()), "CC".into()),
                (Some("Boson".into()), "DD".into()),
                (Some("Katal".into()), "AA".into()),
            ]
        );
    }

    #[test]
    fn keeps_earlier_name() {
        let mut t = DeviceTable::default();
        t.observe(&adv("AA", Some("Kourai"), None), 0);
        t.observe(&adv("AA", None, None), 10);
        assert_eq!(t.snapshot()[0].display_name.as_deref(), Some("Kourai"));
    }

    #[test]
    fn prunes_after_window() {
        let mut t = DeviceTable::default();
        t.observe(&adv("AA", None, Some(1)), 0);
        t.observe(&adv("BB", None, Some(2)), 4_000);
        assert!(!t.prune(6_000));
        assert_eq!(t.len(), 2);
        assert!(t.prune(6_001));
        let left: Vec<String> = t.snapshot().into_iter().map(|d| d.address).collect();
        assert_eq!(left, vec!["BB".to_string()]);
    }
}
