//! MQTT client identifiers
//!
//! Every connection gets `{machine}-{host}-{user}` where `machine` is the
//! first non-loopback MAC address, or a random UUID when none can be read.
//! Brokers with several clients append the client index.

use std::fs;
use std::path::Path;
use uuid::Uuid;

const SYS_CLASS_NET: &str = "/sys/class/net";

/// Identifier prefix shared by every connection of this process
pub fn client_id_base() -> String {
    let machine = mac_address(Path::new(SYS_CLASS_NET)).unwrap_or_else(|| Uuid::new_v4().to_string());
    let host = env_first(&["HOSTNAME", "COMPUTERNAME"]).unwrap_or_else(|| "localhost".to_string());
    let user = env_first(&["USER", "USERNAME"]).unwrap_or_else(|| "user".to_string());
    format!("{machine}-{host}-{user}").replace(' ', ".")
}

/// Identifier of client `index` out of `client_count` on one broker
pub fn client_id(base: &str, index: usize, client_count: usize) -> String {
    if client_count > 1 {
        format!("{base}-{index}")
    } else {
        base.to_string()
    }
}

fn env_first(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| std::env::var(key).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

/// First usable MAC address under a sysfs `class/net` directory, hex digits only
fn mac_address(net: &Path) -> Option<String> {
    let mut interfaces: Vec<_> = fs::read_dir(net).ok()?.filter_map(Result::ok).map(|e| e.path()).collect();
    interfaces.sort();

    interfaces
        .iter()
        .filter(|path| path.file_name().is_some_and(|name| name != "lo"))
        .filter_map(|path| fs::read_to_string(path.join("address")).ok())
        .map(|address| address.trim().replace(':', ""))
        .find(|address| !address.is_empty() && address.chars().any(|c| c != '0'))
}
