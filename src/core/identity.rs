//! Addresses, public keys and private keys
//!
//! An address is derived from a pair of secp256k1 keys: the RIPEMD-160 of the
//! SHA-512 of both uncompressed public keys. Version 4 addresses additionally
//! derive a tag and a symmetric-like decryption key used to publish their
//! public keys without revealing the address to observers.

use bitflags::bitflags;
use bytes::BufMut;
use secp256k1::{PublicKey, SecretKey};
use std::fmt;
use std::io::{Cursor, Read};
use std::str::FromStr;

use super::encoding::{
    put_var_bytes, put_var_int, read_array, read_u32, read_var_bytes, read_var_int,
};
use super::object::{
    ObjectMessage, ObjectType, NETWORK_EXTRA_BYTES, NETWORK_NONCE_TRIALS_PER_BYTE,
};
use super::payload::{GetPubkey, ObjectPayload, PubkeyPayload, MAX_SIGNATURE_SIZE};
use crate::crypto::{
    double_sha512, generate_secret_key, public_key_from_bytes, public_key_of,
    public_key_to_bytes, ripemd160_sha512, secret_key_from_bytes, sign, verify, CryptoBox,
    CryptoError,
};

/// Prefix of every address string
pub const ADDRESS_PREFIX: &str = "BM-";

/// Address version generated for new identities
pub const CURRENT_ADDRESS_VERSION: u64 = 4;

bitflags! {
    /// Behaviour bitfield published with a public key
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Behavior: u32 {
        /// The owner sends acknowledgements
        const DOES_ACK = 1;
        /// Messages must carry the destination ripe
        const INCLUDE_DESTINATION = 1 << 1;
    }
}

// =============================================================================
// Pubkey
// =============================================================================

/// The public half of an identity, as published on the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pubkey {
    pub version: u64,
    pub stream: u64,
    pub behavior: Behavior,
    pub signing_key: PublicKey,
    pub encryption_key: PublicKey,
    pub nonce_trials_per_byte: u64,
    pub extra_bytes: u64,
}

impl Pubkey {
    pub fn ripe(&self) -> [u8; 20] {
        let mut data = Vec::with_capacity(130);
        data.extend_from_slice(&self.signing_key.serialize_uncompressed());
        data.extend_from_slice(&self.encryption_key.serialize_uncompressed());
        ripemd160_sha512(&data)
    }

    /// Behaviour, keys and (from version 3 on) the demanded difficulty
    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.behavior.bits());
        buf.put_slice(&public_key_to_bytes(&self.signing_key));
        buf.put_slice(&public_key_to_bytes(&self.encryption_key));
        if self.version >= 3 {
            put_var_int(buf, self.nonce_trials_per_byte);
            put_var_int(buf, self.extra_bytes);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(140);
        self.write(&mut buf);
        buf
    }

    /// Counterpart of [`Pubkey::write`]; version and stream come from context
    pub fn read(version: u64, stream: u64, r: &mut impl Read) -> Result<Self, CryptoError> {
        let behavior = Behavior::from_bits_retain(read_u32(r)?);
        let signing_key = public_key_from_bytes(&read_array::<64>(r)?)?;
        let encryption_key = public_key_from_bytes(&read_array::<64>(r)?)?;
        let (nonce_trials_per_byte, extra_bytes) = if version >= 3 {
            (read_var_int(r)?, read_var_int(r)?)
        } else {
            (NETWORK_NONCE_TRIALS_PER_BYTE, NETWORK_EXTRA_BYTES)
        };
        Ok(Self {
            version,
            stream,
            behavior,
            signing_key,
            encryption_key,
            nonce_trials_per_byte,
            extra_bytes,
        })
    }

    /// Extract and authenticate the public key of `address` from a pubkey object
    pub fn from_object(
        object: &ObjectMessage,
        address: &BitmessageAddress,
    ) -> Result<Self, CryptoError> {
        let pubkey = match object.payload()? {
            ObjectPayload::Pubkey(PubkeyPayload::V2 {
                behavior,
                signing_key,
                encryption_key,
            }) => Self {
                version: object.version,
                stream: object.stream,
                behavior: Behavior::from_bits_retain(behavior),
                signing_key: public_key_from_bytes(&signing_key)?,
                encryption_key: public_key_from_bytes(&encryption_key)?,
                nonce_trials_per_byte: NETWORK_NONCE_TRIALS_PER_BYTE,
                extra_bytes: NETWORK_EXTRA_BYTES,
            },
            ObjectPayload::Pubkey(PubkeyPayload::V3 {
                behavior,
                signing_key,
                encryption_key,
                nonce_trials_per_byte,
                extra_bytes,
                signature,
            }) => {
                let pubkey = Self {
                    version: object.version,
                    stream: object.stream,
                    behavior: Behavior::from_bits_retain(behavior),
                    signing_key: public_key_from_bytes(&signing_key)?,
                    encryption_key: public_key_from_bytes(&encryption_key)?,
                    nonce_trials_per_byte,
                    extra_bytes,
                };
                let signed = [&object.header_bytes()[..], &pubkey.to_bytes()[..]].concat();
                if !verify(&pubkey.signing_key, &signed, &signature) {
                    return Err(CryptoError::InvalidSignature);
                }
                pubkey
            }
            ObjectPayload::Pubkey(PubkeyPayload::V4 { tag, encrypted }) => {
                if tag != address.tag() {
                    return Err(CryptoError::AddressMismatch);
                }
                let plain = encrypted.decrypt(&address.public_decryption_key()?)?;
                let mut cursor = Cursor::new(plain.as_slice());
                let pubkey = Self::read(object.version, object.stream, &mut cursor)?;
                let signed_len = cursor.position() as usize;
                let signature = read_var_bytes(&mut cursor, MAX_SIGNATURE_SIZE)?;

                let signed = [&object.header_bytes()[..], &tag[..], &plain[..signed_len]].concat();
                if !verify(&pubkey.signing_key, &signed, &signature) {
                    return Err(CryptoError::InvalidSignature);
                }
                pubkey
            }
            _ => {
                return Err(CryptoError::InvalidAddress(format!(
                    "object type {} v{} is not a pubkey",
                    object.object_type, object.version
                )))
            }
        };

        if pubkey.ripe() != address.ripe {
            return Err(CryptoError::AddressMismatch);
        }
        Ok(pubkey)
    }

    /// Build the unstamped pubkey object announcing this key
    pub fn to_object(
        &self,
        private_key: &PrivateKey,
        expires_time: i64,
    ) -> Result<ObjectMessage, CryptoError> {
        let mut object = ObjectMessage::new(
            expires_time,
            ObjectType::Pubkey.number(),
            self.version,
            self.stream,
            Vec::new(),
        );
        let header = object.header_bytes();
        let fields = self.to_bytes();

        let payload = match self.version {
            2 => PubkeyPayload::V2 {
                behavior: self.behavior.bits(),
                signing_key: public_key_to_bytes(&self.signing_key),
                encryption_key: public_key_to_bytes(&self.encryption_key),
            },
            3 => PubkeyPayload::V3 {
                behavior: self.behavior.bits(),
                signing_key: public_key_to_bytes(&self.signing_key),
                encryption_key: public_key_to_bytes(&self.encryption_key),
                nonce_trials_per_byte: self.nonce_trials_per_byte,
                extra_bytes: self.extra_bytes,
                signature: sign(private_key.signing_key(), &[&header[..], &fields[..]].concat()),
            },
            4 => {
                let address = BitmessageAddress::from_pubkey(self.clone());
                let tag = address.tag();
                let signature =
                    sign(private_key.signing_key(), &[&header[..], &tag[..], &fields[..]].concat());
                let mut plain = fields;
                put_var_bytes(&mut plain, &signature);
                let key = public_key_of(&address.public_decryption_key()?);
                PubkeyPayload::V4 {
                    tag,
                    encrypted: CryptoBox::encrypt(&plain, &key)?,
                }
            }
            version => {
                return Err(CryptoError::InvalidAddress(format!(
                    "unsupported address version {version}"
                )))
            }
        };

        object.body = ObjectPayload::Pubkey(payload).to_bytes();
        Ok(object)
    }
}

// =============================================================================
// PrivateKey
// =============================================================================

/// Signing and encryption secrets of an identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateKey {
    signing: SecretKey,
    encryption: SecretKey,
}

impl PrivateKey {
    pub fn new(signing: SecretKey, encryption: SecretKey) -> Self {
        Self { signing, encryption }
    }

    pub fn generate() -> Self {
        Self::new(generate_secret_key(), generate_secret_key())
    }

    pub fn signing_key(&self) -> &SecretKey {
        &self.signing
    }

    pub fn encryption_key(&self) -> &SecretKey {
        &self.encryption
    }

    pub fn pubkey(
        &self,
        version: u64,
        stream: u64,
        behavior: Behavior,
        nonce_trials_per_byte: u64,
        extra_bytes: u64,
    ) -> Pubkey {
        Pubkey {
            version,
            stream,
            behavior,
            signing_key: public_key_of(&self.signing),
            encryption_key: public_key_of(&self.encryption),
            nonce_trials_per_byte,
            extra_bytes,
        }
    }
}

// =============================================================================
// BitmessageAddress
// =============================================================================

/// An address, optionally with its public key and (for own identities) its
/// private key
#[derive(Debug, Clone)]
pub struct BitmessageAddress {
    version: u64,
    stream: u64,
    ripe: [u8; 20],
    pubkey: Option<Pubkey>,
    private_key: Option<PrivateKey>,
}

impl BitmessageAddress {
    /// Generate a fresh identity. Key pairs are drawn until the ripe starts
    /// with a zero byte, or two with `shorter`, which shortens the address.
    pub fn new_identity(
        stream: u64,
        behavior: Behavior,
        shorter: bool,
        nonce_trials_per_byte: u64,
        extra_bytes: u64,
    ) -> Self {
        loop {
            let private_key = PrivateKey::generate();
            let pubkey = private_key.pubkey(
                CURRENT_ADDRESS_VERSION,
                stream,
                behavior,
                nonce_trials_per_byte,
                extra_bytes,
            );
            let ripe = pubkey.ripe();
            if ripe[0] == 0 && (!shorter || ripe[1] == 0) {
                return Self {
                    version: CURRENT_ADDRESS_VERSION,
                    stream,
                    ripe,
                    pubkey: Some(pubkey),
                    private_key: Some(private_key),
                };
            }
        }
    }

    /// Restore an identity from its two secrets
    pub fn from_private_key(
        private_key: PrivateKey,
        version: u64,
        stream: u64,
        behavior: Behavior,
    ) -> Self {
        let pubkey = private_key.pubkey(
            version,
            stream,
            behavior,
            NETWORK_NONCE_TRIALS_PER_BYTE,
            NETWORK_EXTRA_BYTES,
        );
        let mut address = Self::from_pubkey(pubkey);
        address.private_key = Some(private_key);
        address
    }

    pub fn from_pubkey(pubkey: Pubkey) -> Self {
        Self {
            version: pubkey.version,
            stream: pubkey.stream,
            ripe: pubkey.ripe(),
            pubkey: Some(pubkey),
            private_key: None,
        }
    }

    /// Secret key hex pair, as printed by the CLI
    pub fn export_private_key(&self) -> Option<(String, String)> {
        self.private_key.as_ref().map(|key| {
            (
                hex::encode(key.signing.secret_bytes()),
                hex::encode(key.encryption.secret_bytes()),
            )
        })
    }

    pub fn import_private_key(
        signing_hex: &str,
        encryption_hex: &str,
        stream: u64,
    ) -> Result<Self, CryptoError> {
        let decode = |value: &str| {
            hex::decode(value).map_err(|_| CryptoError::InvalidPrivateKey)
        };
        let private_key = PrivateKey::new(
            secret_key_from_bytes(&decode(signing_hex)?)?,
            secret_key_from_bytes(&decode(encryption_hex)?)?,
        );
        Ok(Self::from_private_key(
            private_key,
            CURRENT_ADDRESS_VERSION,
            stream,
            Behavior::DOES_ACK,
        ))
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn stream(&self) -> u64 {
        self.stream
    }

    pub fn ripe(&self) -> &[u8; 20] {
        &self.ripe
    }

    pub fn pubkey(&self) -> Option<&Pubkey> {
        self.pubkey.as_ref()
    }

    pub fn private_key(&self) -> Option<&PrivateKey> {
        self.private_key.as_ref()
    }

    /// Attach a public key received from the network
    pub fn set_pubkey(&mut self, pubkey: Pubkey) -> Result<(), CryptoError> {
        if pubkey.ripe() != self.ripe {
            return Err(CryptoError::AddressMismatch);
        }
        self.pubkey = Some(pubkey);
        Ok(())
    }

    fn double_hash(&self) -> [u8; 64] {
        let mut data = Vec::with_capacity(30);
        put_var_int(&mut data, self.version);
        put_var_int(&mut data, self.stream);
        data.extend_from_slice(&self.ripe);
        double_sha512(&data)
    }

    /// Tag identifying a v4 address in pubkey requests and broadcasts
    pub fn tag(&self) -> [u8; 32] {
        let mut tag = [0u8; 32];
        tag.copy_from_slice(&self.double_hash()[32..]);
        tag
    }

    /// Key decrypting this address's published v4 pubkey
    pub fn public_decryption_key(&self) -> Result<SecretKey, CryptoError> {
        secret_key_from_bytes(&self.double_hash()[..32])
    }

    fn encode(&self) -> String {
        let skip = if self.version >= 4 {
            self.ripe.iter().take_while(|b| **b == 0).count()
        } else {
            self.ripe.iter().take(2).take_while(|b| **b == 0).count()
        };

        let mut data = Vec::with_capacity(28);
        put_var_int(&mut data, self.version);
        put_var_int(&mut data, self.stream);
        data.extend_from_slice(&self.ripe[skip..]);
        let checksum = double_sha512(&data);
        data.extend_from_slice(&checksum[..4]);

        format!("{}{}", ADDRESS_PREFIX, bs58::encode(data).into_string())
    }
}

impl GetPubkey {
    /// Request matching the version of `address`
    pub fn for_address(address: &BitmessageAddress) -> Self {
        if address.version >= 4 {
            GetPubkey::Tag(address.tag())
        } else {
            GetPubkey::Ripe {
                version: address.version,
                ripe: address.ripe,
            }
        }
    }
}

impl PartialEq for BitmessageAddress {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version && self.stream == other.stream && self.ripe == other.ripe
    }
}

impl Eq for BitmessageAddress {}

impl fmt::Display for BitmessageAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl FromStr for BitmessageAddress {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| CryptoError::InvalidAddress(format!("{s}: {reason}"));

        let encoded = s.trim().strip_prefix(ADDRESS_PREFIX).unwrap_or(s.trim());
        let data = bs58::decode(encoded)
            .into_vec()
            .map_err(|_| invalid("not base58"))?;
        if data.len() < 6 {
            return Err(invalid("too short"));
        }

        let (body, checksum) = data.split_at(data.len() - 4);
        if double_sha512(body)[..4] != *checksum {
            return Err(invalid("checksum mismatch"));
        }

        let mut cursor = Cursor::new(body);
        let version = read_var_int(&mut cursor)?;
        let stream = read_var_int(&mut cursor)?;
        if !(2..=4).contains(&version) {
            return Err(invalid("unsupported version"));
        }

        let stripped = &body[cursor.position() as usize..];
        if stripped.len() > 20 {
            return Err(invalid("ripe too long"));
        }
        let mut ripe = [0u8; 20];
        ripe[20 - stripped.len()..].copy_from_slice(stripped);

        Ok(Self {
            version,
            stream,
            ripe,
            pubkey: None,
            private_key: None,
        })
    }
}
