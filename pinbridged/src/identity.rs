//! Captures the device identity.
//!
//! The identity is the hardware serial, used as the primary key of
//! the device document. It is read once at bootstrap and never
//! changes for the lifetime of the process.

use pinbridge_api::{Error, Result};
use tracing::info;

const CPUINFO: &str = "/proc/cpuinfo";

// Pulls the serial out of /proc/cpuinfo contents. On Raspberry Pi OS
// the line looks like "Serial\t\t: 10000000abcdef01".

fn parse_cpuinfo(contents: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;

        if key.trim() == "Serial" {
            let value = value.trim();

            if !value.is_empty() && value.chars().any(|c| c != '0') {
                return Some(String::from(value));
            }
        }
        None
    })
}

/// Determines the hardware serial. A configured override wins;
/// otherwise the board's serial is read from `/proc/cpuinfo`. In
/// simulator mode a fixed identity is used when neither is available
/// so the daemon can run on a development host.

pub async fn get_hardware_serial(
    override_serial: Option<&str>,
    simulate: bool,
) -> Result<String> {
    if let Some(serial) = override_serial {
        info!("using configured serial {}", serial);
        return Ok(String::from(serial));
    }

    if let Ok(contents) = tokio::fs::read_to_string(CPUINFO).await {
        if let Some(serial) = parse_cpuinfo(&contents) {
            info!("device serial {}", &serial);
            return Ok(serial);
        }
    }

    if simulate {
        Ok(String::from("simulated-device"))
    } else {
        Err(Error::Operation(String::from(
            "couldn't determine the hardware serial",
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpuinfo() {
        let contents = "\
processor\t: 0
model name\t: ARMv7 Processor rev 3 (v7l)
Hardware\t: BCM2711
Revision\t: c03111
Serial\t\t: 10000000abcdef01
Model\t\t: Raspberry Pi 4 Model B Rev 1.1
";

        assert_eq!(
            parse_cpuinfo(contents),
            Some(String::from("10000000abcdef01"))
        );

        // x86 hosts have no Serial line at all.

        assert_eq!(parse_cpuinfo("processor\t: 0\nvendor_id\t: acme\n"), None);

        // An all-zero serial means the kernel couldn't read one.

        assert_eq!(parse_cpuinfo("Serial\t\t: 0000000000000000\n"), None);
    }

    #[tokio::test]
    async fn test_override_wins() {
        assert_eq!(
            get_hardware_serial(Some("custom-serial"), false).await,
            Ok(String::from("custom-serial"))
        );
    }
}
