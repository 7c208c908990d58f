use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

use crate::platform::{AccessMode, HostDirHandle, MountRole};

/// A host directory bound to a path inside the sandbox.
///
/// One binding exists per role for the lifetime of the session. Its presence
/// in the [`SessionContext`] is the record that a capability grant for that
/// role has succeeded; bindings are never removed while the session lives.
#[derive(Debug, Clone)]
pub struct MountBinding {
    guest_path: String,
    mode: AccessMode,
    handle: HostDirHandle,
}

impl MountBinding {
    pub fn new(guest_path: impl Into<String>, mode: AccessMode, handle: HostDirHandle) -> Self {
        Self {
            guest_path: guest_path.into(),
            mode,
            handle,
        }
    }

    pub fn guest_path(&self) -> &str {
        &self.guest_path
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn handle(&self) -> &HostDirHandle {
        &self.handle
    }

    pub fn is_writable(&self) -> bool {
        self.mode == AccessMode::ReadWrite
    }
}

/// Session-scoped mutable state shared by every run.
///
/// Created alongside the sandbox and dropped with it. Mount bindings recorded
/// here persist across runs so a second run never re-prompts for a directory
/// that was already granted.
#[derive(Debug)]
pub struct SessionContext {
    id: String,
    created_at: DateTime<Utc>,
    input: Option<MountBinding>,
    output: Option<MountBinding>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            id: generate_session_id(),
            created_at: Utc::now(),
            input: None,
            output: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The existing binding for a role, if one was established earlier.
    pub fn binding(&self, role: MountRole) -> Option<&MountBinding> {
        match role {
            MountRole::Input => self.input.as_ref(),
            MountRole::Output => self.output.as_ref(),
        }
    }

    pub fn is_bound(&self, role: MountRole) -> bool {
        self.binding(role).is_some()
    }

    /// Record a freshly established binding. Re-recording an already bound
    /// role is a logic error in the orchestrator.
    pub fn record_binding(&mut self, role: MountRole, binding: MountBinding) {
        let slot = match role {
            MountRole::Input => &mut self.input,
            MountRole::Output => &mut self.output,
        };
        debug_assert!(slot.is_none(), "role {role} bound twice");
        *slot = Some(binding);
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a short, unique session ID
pub(crate) fn generate_session_id() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);

    let combined = (timestamp & 0xFFFFFF) << 8 | (counter as u64 & 0xFF);
    format_base36(combined)
}

/// Format a number as base36 string
fn format_base36(mut n: u64) -> String {
    const CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if n == 0 {
        return "0".to_string();
    }

    let mut result = Vec::new();
    while n > 0 {
        result.push(CHARS[(n % 36) as usize]);
        n /= 36;
    }
    result.reverse();
    String::from_utf8(result).unwrap_or_else(|_| "error".to_string())
}
