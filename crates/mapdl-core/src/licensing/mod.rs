//! License handling around a launch.
//!
//! - license type aliases and the `-p` switch
//! - `log` - tailing the license client's `licdebug` file
//! - `server` - reachability of the servers in `ANSYSLMD_LICENSE_FILE`
//! - `util` - explicit checkouts through `ansysli_util`

mod log;
mod server;
mod util;

pub use log::{check_license_file, licdebug_name, LicenseChecker};
pub use server::{check_license_servers, parse_license_servers, LicenseServer};
pub use util::{check_license_available, checkout_license, license_dir};

use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// License names the solver recognises, from most to least complete.
pub const ALLOWABLE_LICENSES: [&str; 4] = ["ansys", "meba", "mech_2", "mech_1"];

static PRODUCT_SWITCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-p\s+\b(\w*)").expect("product switch regex must compile"));

/// Human-readable product name of a license.
pub fn license_description(license: &str) -> Option<&'static str> {
    match license {
        "ansys" => Some("Ansys Mechanical Enterprise"),
        "meba" => Some("Ansys Mechanical Enterprise Solver"),
        "mech_2" => Some("Ansys Mechanical Premium"),
        "mech_1" => Some("Ansys Mechanical Pro"),
        _ => None,
    }
}

/// Map a user-facing license name onto the solver's product code.
///
/// Unknown names are returned lowercased with a warning; newer license
/// servers ignore them.
pub fn normalize_license_type(license_type: &str) -> String {
    let lower = license_type.trim().to_lowercase();

    let normalized = if lower.contains("preppost") {
        "preppost".to_string()
    } else if lower.contains("enterprise") && !lower.contains("solver") {
        "ansys".to_string()
    } else if lower.contains("enterprise") {
        "meba".to_string()
    } else if lower.contains("premium") {
        "mech_2".to_string()
    } else if lower.contains("pro") {
        "mech_1".to_string()
    } else {
        lower
    };

    if normalized != "preppost" && !ALLOWABLE_LICENSES.contains(&normalized.as_str()) {
        warn!(
            "License type '{}' is not a recognized license name. It is passed to MAPDL anyway; \
             recognized names: {}",
            normalized,
            ALLOWABLE_LICENSES.join(" ")
        );
    }
    normalized
}

/// Append `-p <license>` to `switches` for a requested license type.
///
/// Without a license type the switches are returned unchanged, warning when
/// they already carry an unrecognized `-p` product.
pub fn license_switch(license_type: Option<&str>, switches: &str) -> String {
    match license_type {
        Some(license_type) if !license_type.trim().is_empty() => {
            let license = normalize_license_type(license_type);
            debug!("Using license '{}'", license);
            format!("{} -p {}", switches, license).trim().to_string()
        }
        _ => {
            if let Some(product) = PRODUCT_SWITCH_RE
                .captures(switches)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str())
            {
                if !ALLOWABLE_LICENSES.contains(&product) {
                    warn!(
                        "The switch '-p {}' does not name a recognized license; recognized names: {}",
                        product,
                        ALLOWABLE_LICENSES.join(" ")
                    );
                }
            }
            switches.to_string()
        }
    }
}
