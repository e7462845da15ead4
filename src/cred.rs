//! Caller credentials.
//!
//! Protocol-layer authentication (SigV4, NTLM, Kerberos, AUTH_SYS) is
//! resolved into this shape before a request enters the core. The core
//! itself never verifies anything; backends consult the triple for
//! permission checks and the machine name feeds NFS audit logs.

use smallvec::SmallVec;

/// Unix-style credential triple plus the client machine name.
#[derive(Debug, Clone, Default)]
pub struct Cred {
    /// Effective user id.
    pub uid: u32,
    /// Effective group id.
    pub gid: u32,
    /// Supplementary groups.
    pub groups: SmallVec<[u32; 16]>,
    /// Client machine name, for auditing.
    pub machine_name: Option<Box<str>>,
}

impl Cred {
    /// Credential for the given uid/gid with no supplementary groups.
    pub fn new(uid: u32, gid: u32) -> Self {
        Cred {
            uid,
            gid,
            ..Default::default()
        }
    }

    /// The superuser credential.
    pub fn root() -> Self {
        Cred::new(0, 0)
    }

    /// True for uid 0.
    pub fn is_superuser(&self) -> bool {
        self.uid == 0
    }

    /// True when the credential holds the given group, primary or
    /// supplementary.
    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}
