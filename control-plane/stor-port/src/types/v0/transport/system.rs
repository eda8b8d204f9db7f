use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Array technology of a storage system, selecting its device driver.
#[derive(
    Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Technology {
    Vmax,
    Vmax3,
    Vnx,
    VnxE,
    Hds,
    XtremIo,
    Ibmxiv,
    Unity,
}
