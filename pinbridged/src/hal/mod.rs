//! HAL backends.
//!
//! The simulator is always available; the Raspberry Pi backend is
//! compiled in with the `rpi-gpio` feature. Everything above this
//! module works with `Arc<dyn Hal>` and can't tell the two apart.

use pinbridge_api::{hal::Hal, Error, Result};
use std::sync::Arc;

pub mod sim;

#[cfg(feature = "rpi-gpio")]
pub mod rpi;

/// Constructs the HAL selected by the configuration.

pub fn open(simulate: bool) -> Result<Arc<dyn Hal>> {
    if simulate {
        return Ok(Arc::new(sim::SimHal::new()));
    }

    #[cfg(feature = "rpi-gpio")]
    {
        Ok(Arc::new(rpi::RpiHal::new()?))
    }

    #[cfg(not(feature = "rpi-gpio"))]
    {
        Err(Error::Config(String::from(
            "built without the 'rpi-gpio' feature; \
	     set 'simulate_hardware' to run",
        )))
    }
}
