//! Named script resources.

use alloc::string::String;

/// Source of automation scripts by name.
///
/// On the device this is a flash filesystem; on the desktop a directory or a
/// map. A missing script is `None`, the engine turns it into
/// `ScriptNotFound`.
///
/// ```rust
/// use rs_throttle_bridge::traits::ScriptSource;
/// use rs_throttle_bridge::hal::MockScripts;
///
/// let scripts = MockScripts::new().with_script("yard", "throw LT1\nexit");
/// assert!(scripts.read_script("yard").is_some());
/// assert!(scripts.read_script("main").is_none());
/// ```
pub trait ScriptSource {
    /// Full text of the script called `name`.
    fn read_script(&self, name: &str) -> Option<String>;
}
