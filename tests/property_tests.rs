//! Property-Based Tests for pxe-auto
//!
//! These tests verify:
//! - MAC parsing/normalisation and link-name prefixes
//! - Progress thresholds fire exactly once per deployment
//! - Enum string round-trips

use proptest::prelude::*;

// =============================================================================
// MAC Address Property Tests
// =============================================================================

use pxeauto::mac::{MacAddress, hyphenated, mac_config_file_name, mac_from_pxe_interface, parse_mac};
use pxeauto::types::PortKind;

fn octets_strategy() -> impl Strategy<Value = [u8; 6]> {
    prop::array::uniform6(any::<u8>())
}

fn port_kind_strategy() -> impl Strategy<Value = PortKind> {
    prop_oneof![Just(PortKind::Ethernet), Just(PortKind::Infiniband)]
}

proptest! {
    /// Colon, hyphen and upper-case spellings parse to the same address
    #[test]
    fn mac_spellings_agree(octets in octets_strategy()) {
        let mac = MacAddress::new(octets);
        let colon = parse_mac(&hyphenated(&mac).replace('-', ":").to_uppercase()).expect("colon form");
        let dash = parse_mac(&hyphenated(&mac)).expect("dash form");
        prop_assert_eq!(colon, mac);
        prop_assert_eq!(dash, mac);
    }

    /// Link names are lowercase, hyphenated and carry the right prefix
    #[test]
    fn link_name_shape(octets in octets_strategy(), kind in port_kind_strategy(), prefixed in any::<bool>()) {
        let mac = MacAddress::new(octets);
        let name = mac_config_file_name(&mac, prefixed, kind);
        let bare = hyphenated(&mac);

        prop_assert_eq!(name.to_lowercase(), name.clone());
        prop_assert!(!name.contains(':'));
        if prefixed {
            let expected = match kind {
                PortKind::Ethernet => "01-",
                PortKind::Infiniband => "20-",
            };
            prop_assert_eq!(name, format!("{}{}", expected, bare));
        } else {
            prop_assert_eq!(name, bare);
        }
    }

    /// A PXE interface id with any 3-char prefix yields the same MAC
    #[test]
    fn pxe_interface_strips_prefix(octets in octets_strategy(), prefix in "[0-9a-f]{2}-") {
        let mac = MacAddress::new(octets);
        let id = format!("{}{}", prefix, hyphenated(&mac));
        prop_assert_eq!(mac_from_pxe_interface(&id).expect("parse"), mac);
    }

    /// Garbage never parses
    #[test]
    fn short_or_long_macs_rejected(octets in prop::collection::vec(any::<u8>(), 0..12)) {
        prop_assume!(octets.len() != 6);
        let text = octets.iter().map(|o| format!("{:02x}", o)).collect::<Vec<_>>().join(":");
        prop_assert!(parse_mac(&text).is_err());
    }
}

// =============================================================================
// Progress Threshold Property Tests
// =============================================================================

use pxeauto::install_state::DeploymentContext;
use pxeauto::progress::ProgressReport;

proptest! {
    /// However reports arrive, resume and completion each fire at most once,
    /// and exactly once if the maximum seen reached their threshold
    #[test]
    fn thresholds_fire_once(fractions in prop::collection::vec(0.0f64..=1.0, 1..40)) {
        let mut ctx = DeploymentContext::new();
        let mut resumes = 0;
        let mut completions = 0;

        for fraction in &fractions {
            let report = ProgressReport::new("step", *fraction).expect("valid");
            let crossings = ctx.observe_progress(report.percent());
            resumes += usize::from(crossings.resume);
            completions += usize::from(crossings.complete);
            // Completion is never reported ahead of resume
            prop_assert!(!crossings.complete || ctx.highest_progress().unwrap_or(0.0) >= 60.0);
        }

        let max = fractions.iter().cloned().fold(0.0f64, f64::max) * 100.0;
        prop_assert_eq!(resumes, usize::from(max + 1e-6 >= 60.0));
        prop_assert_eq!(completions, usize::from(max + 1e-6 >= 100.0));
    }

    /// The highest progress seen never goes down
    #[test]
    fn highest_progress_is_monotonic(fractions in prop::collection::vec(0.0f64..=1.0, 1..40)) {
        let mut ctx = DeploymentContext::new();
        let mut previous = 0.0f64;
        for fraction in fractions {
            ctx.observe_progress(fraction * 100.0);
            let highest = ctx.highest_progress().expect("seen");
            prop_assert!(highest >= previous);
            previous = highest;
        }
    }

    /// Out-of-range fractions are rejected
    #[test]
    fn out_of_range_reports_rejected(fraction in prop_oneof![-1.0e6f64..-1.0e-9, 1.0000001f64..1.0e6]) {
        prop_assert!(ProgressReport::new("x", fraction).is_err());
    }
}

// =============================================================================
// Enum Property Tests
// =============================================================================

use pxeauto::types::{BootDevice, BootDevicePolicy};

fn boot_device_strategy() -> impl Strategy<Value = BootDevice> {
    prop_oneof![Just(BootDevice::Pxe), Just(BootDevice::Disk)]
}

fn policy_strategy() -> impl Strategy<Value = BootDevicePolicy> {
    prop_oneof![Just(BootDevicePolicy::FailOpen), Just(BootDevicePolicy::FailClosed)]
}

proptest! {
    /// BootDevice: to_string → parse round-trip is identity
    #[test]
    fn boot_device_roundtrip(device in boot_device_strategy()) {
        let s = device.to_string();
        let parsed: BootDevice = s.parse().expect("Should parse");
        prop_assert_eq!(device, parsed);
    }

    /// BootDevicePolicy: serde name matches Display
    #[test]
    fn policy_serde_matches_display(policy in policy_strategy()) {
        let json = serde_json::to_string(&policy).expect("serialize");
        prop_assert_eq!(json, format!("\"{}\"", policy));
    }
}
