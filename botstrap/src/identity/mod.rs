//! Execution identity creation.
//!
//! The identity is created by editing the rootfs account databases
//! directly, so no `useradd` binary and no root on the build host are needed.

mod passwd;

pub use passwd::{GroupEntry, PasswdEntry, append_line, parse_group, parse_passwd};

use crate::rootfs::{Owner, Rootfs};
use crate::runtime::constants::{identity as defaults, image_paths};
use botstrap_shared::errors::{BotstrapError, BotstrapResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The principal a stage or process runs as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Identity {
    Root,
    User(ExecutionIdentity),
}

impl Identity {
    pub fn is_root(&self) -> bool {
        match self {
            Identity::Root => true,
            Identity::User(user) => user.uid == 0,
        }
    }

    /// Value for the OCI `User` field.
    pub fn oci_user(&self) -> String {
        match self {
            Identity::Root => "root".to_string(),
            Identity::User(user) => user.name.clone(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Root => f.write_str("root"),
            Identity::User(user) => write!(f, "{}({})", user.name, user.uid),
        }
    }
}

/// A non-privileged OS identity created in the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionIdentity {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub shell: String,
}

/// Identity creation request.
#[derive(Debug, Clone)]
pub struct IdentityRequest {
    pub name: String,
    /// Fixed uid; the first free id from 1000 when `None`.
    pub uid: Option<u32>,
    /// Fixed gid; same as the uid when `None`.
    pub gid: Option<u32>,
    pub shell: String,
}

impl IdentityRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: None,
            gid: None,
            shell: defaults::DEFAULT_SHELL.to_string(),
        }
    }
}

fn first_free_id(taken: &[u32], preferred: Option<u32>) -> Option<u32> {
    if let Some(id) = preferred.filter(|id| !taken.contains(id)) {
        return Some(id);
    }
    (defaults::FIRST_UNPRIVILEGED_ID..=defaults::LAST_UNPRIVILEGED_ID).find(|id| !taken.contains(id))
}

/// Create the identity, its primary group and home directory in `rootfs`.
///
/// Fails with [`BotstrapError::IdentityConflict`] if the user or group name
/// already exists, or a pinned uid/gid is taken.
pub fn create_identity(
    rootfs: &mut Rootfs,
    request: &IdentityRequest,
) -> BotstrapResult<ExecutionIdentity> {
    let passwd_text = rootfs.read_optional(image_paths::PASSWD)?;
    let group_text = rootfs.read_optional(image_paths::GROUP)?;
    let users = parse_passwd(&passwd_text)?;
    let groups = parse_group(&group_text)?;

    if users.iter().any(|u| u.name == request.name) {
        return Err(BotstrapError::IdentityConflict(format!(
            "user '{}' already exists in the base image",
            request.name
        )));
    }
    if groups.iter().any(|g| g.name == request.name) {
        return Err(BotstrapError::IdentityConflict(format!(
            "group '{}' already exists in the base image",
            request.name
        )));
    }

    let uids: Vec<u32> = users.iter().map(|u| u.uid).collect();
    let gids: Vec<u32> = groups.iter().map(|g| g.gid).collect();

    let uid = match request.uid {
        Some(0) => {
            return Err(BotstrapError::Privilege(
                "execution identity cannot use uid 0".into(),
            ));
        }
        Some(uid) if uids.contains(&uid) => {
            return Err(BotstrapError::IdentityConflict(format!("uid {} is already taken", uid)));
        }
        Some(uid) => uid,
        None => first_free_id(&uids, None).ok_or_else(|| {
            BotstrapError::IdentityConflict("no free uid in the unprivileged range".into())
        })?,
    };

    let gid = match request.gid {
        Some(0) => {
            return Err(BotstrapError::Privilege(
                "execution identity cannot use gid 0".into(),
            ));
        }
        Some(gid) if gids.contains(&gid) => {
            return Err(BotstrapError::IdentityConflict(format!("gid {} is already taken", gid)));
        }
        Some(gid) => gid,
        None => first_free_id(&gids, Some(uid)).ok_or_else(|| {
            BotstrapError::IdentityConflict("no free gid in the unprivileged range".into())
        })?,
    };

    let home = format!("{}/{}", image_paths::HOME_ROOT, request.name);
    if rootfs.exists(&home) {
        return Err(BotstrapError::IdentityConflict(format!(
            "home directory {} already exists",
            home
        )));
    }
    let user = PasswdEntry {
        name: request.name.clone(),
        uid,
        gid,
        gecos: String::new(),
        home: home.clone(),
        shell: request.shell.clone(),
    };
    let group = GroupEntry {
        name: request.name.clone(),
        gid,
        members: Vec::new(),
    };

    rootfs.write_file(
        image_paths::GROUP,
        append_line(&group_text, &group.to_line()).as_bytes(),
        0o644,
    )?;
    rootfs.write_file(
        image_paths::PASSWD,
        append_line(&passwd_text, &user.to_line()).as_bytes(),
        0o644,
    )?;

    rootfs.create_dir_all(&home, defaults::HOME_MODE)?;
    rootfs.set_owner(&home, Owner { uid, gid })?;

    tracing::info!(user = %request.name, uid, gid, home = %home, "Execution identity created");

    Ok(ExecutionIdentity {
        name: request.name.clone(),
        uid,
        gid,
        home,
        shell: request.shell.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn base() -> (TempDir, Rootfs) {
        let temp = TempDir::new().unwrap();
        let mut rootfs = Rootfs::open(temp.path());
        rootfs
            .write_file(
                "/etc/passwd",
                b"root:x:0:0:root:/root:/bin/bash\nexisting:x:1000:1000::/home/existing:/bin/sh\n",
                0o644,
            )
            .unwrap();
        rootfs
            .write_file("/etc/group", b"root:x:0:\nexisting:x:1000:\n", 0o644)
            .unwrap();
        rootfs.take_changes();
        (temp, rootfs)
    }

    #[test]
    fn test_create_identity_picks_free_id() {
        let (_temp, mut rootfs) = base();
        let identity = create_identity(&mut rootfs, &IdentityRequest::named("botuser")).unwrap();

        assert_eq!(identity.uid, 1001);
        assert_eq!(identity.gid, 1001);
        assert_eq!(identity.home, "/home/botuser");

        let passwd = rootfs.read_to_string("/etc/passwd").unwrap();
        assert!(passwd.ends_with("botuser:x:1001:1001::/home/botuser:/bin/sh\n"));
        let group = rootfs.read_to_string("/etc/group").unwrap();
        assert!(group.ends_with("botuser:x:1001:\n"));

        let changes = rootfs.take_changes();
        assert_eq!(
            changes.owner_of(std::path::Path::new("/home/botuser")),
            Owner { uid: 1001, gid: 1001 }
        );
    }

    #[test]
    fn test_existing_name_conflicts() {
        let (_temp, mut rootfs) = base();
        let err = create_identity(&mut rootfs, &IdentityRequest::named("existing")).unwrap_err();
        assert!(matches!(err, BotstrapError::IdentityConflict(_)));
        assert!(rootfs.pending_changes().is_empty());
    }

    #[test]
    fn test_pinned_uid_taken() {
        let (_temp, mut rootfs) = base();
        let mut request = IdentityRequest::named("botuser");
        request.uid = Some(1000);
        assert!(matches!(
            create_identity(&mut rootfs, &request),
            Err(BotstrapError::IdentityConflict(_))
        ));
    }

    #[test]
    fn test_uid_zero_refused() {
        let (_temp, mut rootfs) = base();
        let mut request = IdentityRequest::named("botuser");
        request.uid = Some(0);
        assert!(matches!(
            create_identity(&mut rootfs, &request),
            Err(BotstrapError::Privilege(_))
        ));
    }

    #[test]
    fn test_identity_root_detection() {
        assert!(Identity::Root.is_root());
        let user = Identity::User(ExecutionIdentity {
            name: "botuser".into(),
            uid: 1000,
            gid: 1000,
            home: "/home/botuser".into(),
            shell: "/bin/sh".into(),
        });
        assert!(!user.is_root());
        assert_eq!(user.oci_user(), "botuser");
    }
}
