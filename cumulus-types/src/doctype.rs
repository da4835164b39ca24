//! Doctype names and the reserved-doctype list.

/// Files and directories.
pub const FILES: &str = "io.cozy.files";

/// Sharing aggregates.
pub const SHARINGS: &str = "io.cozy.sharings";

/// Shared-document index entries.
pub const SHARED: &str = "io.cozy.shared";

/// Registered OAuth clients.
pub const OAUTH_CLIENTS: &str = "io.cozy.oauth.clients";

/// OAuth access codes.
pub const OAUTH_ACCESS_CODES: &str = "io.cozy.oauth.access_codes";

/// Instance settings.
pub const SETTINGS: &str = "io.cozy.settings";

/// Background jobs.
pub const JOBS: &str = "io.cozy.jobs";

/// Job triggers.
pub const TRIGGERS: &str = "io.cozy.triggers";

/// Permission sets.
pub const PERMISSIONS: &str = "io.cozy.permissions";

/// Value of the `type` field of a directory.
pub const DIR_TYPE: &str = "directory";

/// Value of the `type` field of a regular file.
pub const FILE_TYPE: &str = "file";

/// Identifier of the root directory.
pub const ROOT_DIR_ID: &str = "io.cozy.files.root-dir";

/// Identifier of the trash directory.
pub const TRASH_DIR_ID: &str = "io.cozy.files.trash-dir";

/// Doctypes that can never be the target of a sharing rule.
pub const BLOCKED: &[&str] = &[
    SHARINGS,
    SHARED,
    OAUTH_CLIENTS,
    OAUTH_ACCESS_CODES,
    SETTINGS,
    JOBS,
    TRIGGERS,
    PERMISSIONS,
];

/// Returns true if documents of this doctype may not be shared.
#[must_use]
pub fn is_blocked(doctype: &str) -> bool {
    BLOCKED.contains(&doctype)
}
