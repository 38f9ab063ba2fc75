//! Node identity: an X25519 keypair plus the short wire address derived
//! from the public key.
//!
//! The address is the first five bytes of an iterated SHA-256 chain over the
//! public key. The iteration count makes cold identity generation visibly
//! expensive while keeping verification of a received identity cheap enough
//! to do on every parse. Addresses starting with 0xff and the all-zero
//! address are reserved; candidate keypairs that derive one are thrown away.

use anyhow::{anyhow, bail, Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use snow::params::DHChoice;
use snow::resolvers::{CryptoResolver, DefaultResolver};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Rounds of the address derivation hash chain.
const ADDRESS_DERIVATION_ROUNDS: usize = 4096;

/// Identity type tag carried in the serialized form.
const IDENTITY_TYPE: &str = "1";

pub const ADDRESS_LENGTH: usize = 5;

/// Five-byte node address, rendered as ten lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Address(pub [u8; ADDRESS_LENGTH]);

impl Address {
    /// Reserved addresses never belong to a live node.
    pub fn is_reserved(&self) -> bool {
        self.0[0] == 0xff || self.0 == [0u8; ADDRESS_LENGTH]
    }

    pub fn to_u64(&self) -> u64 {
        let mut v = 0u64;
        for b in self.0 {
            v = (v << 8) | b as u64;
        }
        v
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_hex(&self.0))
    }
}

impl FromStr for Address {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = from_hex(s)?;
        if bytes.len() != ADDRESS_LENGTH {
            bail!("address must be {} hex bytes", ADDRESS_LENGTH);
        }
        let mut a = [0u8; ADDRESS_LENGTH];
        a.copy_from_slice(&bytes);
        Ok(Address(a))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct SecretKey([u8; 32]);

/// A node identity. Public-only identities (parsed from a peer's HELLO or
/// from `identity.public`) carry no secret half.
#[derive(Clone)]
pub struct Identity {
    address: Address,
    public: [u8; 32],
    secret: Option<SecretKey>,
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.public == other.public
            && match (&self.secret, &other.secret) {
                (Some(a), Some(b)) => a.0 == b.0,
                (None, None) => true,
                _ => false,
            }
    }
}

impl Eq for Identity {}

impl Identity {
    /// Generate a fresh identity, discarding keypairs whose derived address
    /// is reserved.
    pub fn generate() -> Self {
        loop {
            let mut private = [0u8; 32];
            OsRng.fill_bytes(&mut private);
            let public = derive_public_key(&private);
            if let Some(address) = derive_address(&public) {
                return Self {
                    address,
                    public,
                    secret: Some(SecretKey(private)),
                };
            }
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public
    }

    pub fn has_private(&self) -> bool {
        self.secret.is_some()
    }

    /// Strip the secret half.
    pub fn public_only(&self) -> Identity {
        Identity {
            address: self.address,
            public: self.public,
            secret: None,
        }
    }

    /// X25519 agreement with another identity's public key, hashed down to
    /// a 32-byte symmetric key.
    pub fn agree(&self, other_public: &[u8; 32]) -> Result<[u8; 32]> {
        let secret = self
            .secret
            .as_ref()
            .ok_or_else(|| anyhow!("identity has no private key"))?;
        let resolver = DefaultResolver;
        let mut dh = resolver.resolve_dh(&DHChoice::Curve25519).unwrap();
        dh.set(&secret.0);
        let mut shared = [0u8; 32];
        dh.dh(other_public, &mut shared)
            .map_err(|_| anyhow!("key agreement failed"))?;
        let key: [u8; 32] = Sha256::digest(shared).into();
        shared.zeroize();
        Ok(key)
    }

    /// Serialized form: `address:1:publichex[:privatehex]`.
    pub fn serialize(&self, include_private: bool) -> String {
        match (&self.secret, include_private) {
            (Some(secret), true) => format!(
                "{}:{}:{}:{}",
                self.address,
                IDENTITY_TYPE,
                to_hex(&self.public),
                to_hex(&secret.0)
            ),
            _ => format!("{}:{}:{}", self.address, IDENTITY_TYPE, to_hex(&self.public)),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize(false))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .field("has_private", &self.secret.is_some())
            .finish()
    }
}

impl FromStr for Identity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.trim().split(':').collect();
        if fields.len() != 3 && fields.len() != 4 {
            bail!("identity must have 3 or 4 colon-separated fields");
        }
        if fields[1] != IDENTITY_TYPE {
            bail!("unknown identity type {:?}", fields[1]);
        }

        let address: Address = fields[0].parse().context("bad identity address")?;
        let public_vec = from_hex(fields[2]).context("bad identity public key")?;
        let public: [u8; 32] = public_vec
            .try_into()
            .map_err(|_| anyhow!("identity public key must be 32 bytes"))?;

        let derived = derive_address(&public)
            .ok_or_else(|| anyhow!("identity public key derives a reserved address"))?;
        if derived != address {
            bail!("identity address does not match its public key");
        }

        let secret = if fields.len() == 4 {
            let priv_vec = from_hex(fields[3]).context("bad identity private key")?;
            let private: [u8; 32] = priv_vec
                .try_into()
                .map_err(|_| anyhow!("identity private key must be 32 bytes"))?;
            if derive_public_key(&private) != public {
                bail!("identity private key does not match its public key");
            }
            Some(SecretKey(private))
        } else {
            None
        };

        Ok(Identity {
            address,
            public,
            secret,
        })
    }
}

/// Load the identity from a home directory, generating one if absent, and
/// guarantee both on-disk forms are present, consistent, and locked down.
///
/// A present-but-unparseable `identity.secret` is an error; the caller
/// treats every error from here as unrecoverable.
pub fn init_from_home(home: &Path) -> Result<Identity> {
    let secret_path = home.join("identity.secret");
    let public_path = home.join("identity.public");

    let identity = match fs::read_to_string(&secret_path) {
        Ok(raw) => {
            let identity: Identity = raw
                .parse()
                .with_context(|| format!("could not parse {:?}", secret_path))?;
            if !identity.has_private() {
                bail!("{:?} contains a public-only identity", secret_path);
            }

            // Keep identity.public equal to the public projection of the
            // secret file, overwriting only on mismatch.
            let pub_form = identity.serialize(false);
            let on_disk = fs::read_to_string(&public_path).unwrap_or_default();
            if on_disk != pub_form {
                fs::write(&public_path, &pub_form)
                    .context("could not write identity.public (home path not writable?)")?;
            }
            identity
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("no identity found, generating one...");
            let identity = Identity::generate();
            log::info!("generated new identity: {}", identity.address());
            fs::write(&secret_path, identity.serialize(true))
                .context("could not write identity.secret (home path not writable?)")?;
            fs::write(&public_path, identity.serialize(false))
                .context("could not write identity.public (home path not writable?)")?;
            identity
        }
        Err(e) => return Err(e).with_context(|| format!("could not read {:?}", secret_path)),
    };

    lock_down(&secret_path)?;
    Ok(identity)
}

/// Owner-only permissions on secret files.
pub fn lock_down(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("could not set permissions on {:?}", path))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn derive_public_key(private: &[u8; 32]) -> [u8; 32] {
    let resolver = DefaultResolver;
    let mut dh = resolver.resolve_dh(&DHChoice::Curve25519).unwrap();
    dh.set(private);
    let mut public = [0u8; 32];
    public.copy_from_slice(dh.pubkey());
    public
}

/// Iterated hash chain from public key to address; `None` when the result
/// lands in reserved space.
fn derive_address(public: &[u8; 32]) -> Option<Address> {
    let mut digest: [u8; 32] = Sha256::digest(public).into();
    for _ in 0..ADDRESS_DERIVATION_ROUNDS {
        let mut hasher = Sha256::new();
        hasher.update(digest);
        hasher.update(public);
        digest = hasher.finalize().into();
    }
    let mut addr = [0u8; ADDRESS_LENGTH];
    addr.copy_from_slice(&digest[..ADDRESS_LENGTH]);
    let addr = Address(addr);
    if addr.is_reserved() {
        None
    } else {
        Some(addr)
    }
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub(crate) fn from_hex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        bail!("hex string has odd length");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| anyhow!("bad hex: {}", e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_parse_round_trip() {
        let id = Identity::generate();
        assert!(!id.address().is_reserved());

        let full: Identity = id.serialize(true).parse().unwrap();
        assert_eq!(full, id);

        let public: Identity = id.serialize(false).parse().unwrap();
        assert!(!public.has_private());
        assert_eq!(public.address(), id.address());
        assert_eq!(public.public_bytes(), id.public_bytes());
    }

    #[test]
    fn tampered_address_is_rejected() {
        let id = Identity::generate();
        let ser = id.serialize(false);
        let mut fields: Vec<String> = ser.split(':').map(String::from).collect();
        fields[0] = if fields[0].starts_with('a') {
            format!("b{}", &fields[0][1..])
        } else {
            format!("a{}", &fields[0][1..])
        };
        assert!(fields.join(":").parse::<Identity>().is_err());
    }

    #[test]
    fn agreement_is_symmetric() {
        let a = Identity::generate();
        let b = Identity::generate();
        let k1 = a.agree(&b.public_bytes()).unwrap();
        let k2 = b.agree(&a.public_bytes()).unwrap();
        assert_eq!(k1, k2);

        let c = Identity::generate();
        assert_ne!(a.agree(&c.public_bytes()).unwrap(), k1);
    }

    #[test]
    fn cold_start_creates_consistent_files() {
        let home = tempfile::tempdir().unwrap();
        let id = init_from_home(home.path()).unwrap();

        let secret = std::fs::read_to_string(home.path().join("identity.secret")).unwrap();
        let public = std::fs::read_to_string(home.path().join("identity.public")).unwrap();
        assert_eq!(secret, id.serialize(true));
        assert_eq!(public, id.serialize(false));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(home.path().join("identity.secret"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        // Restart yields the identical identity.
        let again = init_from_home(home.path()).unwrap();
        assert_eq!(again, id);
    }

    #[test]
    fn stale_public_file_is_rewritten() {
        let home = tempfile::tempdir().unwrap();
        let id = init_from_home(home.path()).unwrap();

        std::fs::write(home.path().join("identity.public"), "garbage").unwrap();
        let again = init_from_home(home.path()).unwrap();
        assert_eq!(again, id);

        let public = std::fs::read_to_string(home.path().join("identity.public")).unwrap();
        assert_eq!(public, id.serialize(false));
    }

    #[test]
    fn corrupt_secret_file_is_fatal() {
        let home = tempfile::tempdir().unwrap();
        std::fs::write(home.path().join("identity.secret"), "not an identity").unwrap();
        assert!(init_from_home(home.path()).is_err());
    }
}
