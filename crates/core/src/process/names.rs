//! Kernel object naming for the supervisor/helper handoff
//!
//! One `HandoffId` is generated per launch attempt. Both processes derive the
//! same pair of names from it, so the helper only needs the identifier on its
//! command line to find the shared segment and the ready event.

use std::fmt;
use uuid::Uuid;

/// Session-local namespace for the named objects
pub const OBJECT_NAMESPACE: &str = r"Local\";

/// Suffix of the shared segment name
const SEGMENT_SUFFIX: char = 'F';

/// Suffix of the ready/stop event name
const EVENT_SUFFIX: char = 'E';

/// Command line flag that turns the executable into the helper process
pub const RELAUNCH_FLAG: &str = "--pm=";

/// Unique identifier of one launch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandoffId(Uuid);

impl HandoffId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse the braced form produced by `Display` (plain hyphenated is accepted too)
    pub fn parse(text: &str) -> Option<Self> {
        Uuid::parse_str(text.trim()).ok().map(Self)
    }
}

impl fmt::Display for HandoffId {
    /// Registry-style GUID: `{XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX}`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = Uuid::encode_buffer();
        let text = self.0.braced().encode_upper(&mut buf);
        f.write_str(text)
    }
}

/// Names of the two kernel objects belonging to one handoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelObjectNames {
    /// Name of the file mapping
    pub segment: String,
    /// Name of the auto-reset event
    pub event: String,
}

impl KernelObjectNames {
    /// Derive both names from an identifier. Deterministic and side-effect free.
    pub fn derive(id: &HandoffId) -> Self {
        let base = format!("{}{}", OBJECT_NAMESPACE, id);
        Self {
            segment: format!("{}{}", base, SEGMENT_SUFFIX),
            event: format!("{}{}", base, EVENT_SUFFIX),
        }
    }
}

/// Build the argument that relaunches the executable as a helper
pub fn relaunch_arg(id: &HandoffId) -> String {
    format!("{}{}", RELAUNCH_FLAG, id)
}

/// Recognise the relaunch argument.
///
/// Returns `None` when the argument is not a relaunch flag at all and
/// `Some(None)` when it is one but carries a malformed identifier.
pub fn parse_relaunch_arg(arg: &str) -> Option<Option<HandoffId>> {
    arg.strip_prefix(RELAUNCH_FLAG).map(HandoffId::parse)
}
