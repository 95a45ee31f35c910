//! Function codes, status codes, key types and key flags of the alpha RPC protocol

use std::fmt;

/// RPC function codes, including the gateway-local extensions above 1000
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RpcFunc {
    GetVersion = 0,
    GetRandom = 1,
    SetPin = 2,
    Login = 3,
    Logout = 4,
    LogoutAll = 5,
    IsLoggedIn = 6,
    HashGetDigestLen = 7,
    HashGetDigestAlgorithmId = 8,
    HashGetAlgorithm = 9,
    HashInitialize = 10,
    HashUpdate = 11,
    HashFinalize = 12,
    PkeyLoad = 13,
    PkeyOpen = 14,
    PkeyGenerateRsa = 15,
    PkeyGenerateEc = 16,
    PkeyClose = 17,
    PkeyDelete = 18,
    PkeyGetKeyType = 19,
    PkeyGetKeyFlags = 20,
    PkeyGetPublicKeyLen = 21,
    PkeyGetPublicKey = 22,
    PkeySign = 23,
    PkeyVerify = 24,
    PkeyMatch = 25,
    PkeyGetKeyCurve = 26,
    PkeySetAttributes = 27,
    PkeyGetAttributes = 28,
    PkeyExport = 29,
    PkeyImport = 30,
    PkeyGenerateHashsig = 31,
    CheckTamper = 66,
    GetHsmState = 1979,
    GetIp = 1980,
    SetRpcDevice = 1981,
    DisableCacheKeygen = 1982,
    EnableCacheKeygen = 1983,
    UseIncomingDeviceUuids = 1984,
    UseIncomingMasterUuids = 1985,
}

impl RpcFunc {
    pub fn from_code(code: u32) -> Option<Self> {
        use RpcFunc::*;
        let func = match code {
            0 => GetVersion,
            1 => GetRandom,
            2 => SetPin,
            3 => Login,
            4 => Logout,
            5 => LogoutAll,
            6 => IsLoggedIn,
            7 => HashGetDigestLen,
            8 => HashGetDigestAlgorithmId,
            9 => HashGetAlgorithm,
            10 => HashInitialize,
            11 => HashUpdate,
            12 => HashFinalize,
            13 => PkeyLoad,
            14 => PkeyOpen,
            15 => PkeyGenerateRsa,
            16 => PkeyGenerateEc,
            17 => PkeyClose,
            18 => PkeyDelete,
            19 => PkeyGetKeyType,
            20 => PkeyGetKeyFlags,
            21 => PkeyGetPublicKeyLen,
            22 => PkeyGetPublicKey,
            23 => PkeySign,
            24 => PkeyVerify,
            25 => PkeyMatch,
            26 => PkeyGetKeyCurve,
            27 => PkeySetAttributes,
            28 => PkeyGetAttributes,
            29 => PkeyExport,
            30 => PkeyImport,
            31 => PkeyGenerateHashsig,
            66 => CheckTamper,
            1979 => GetHsmState,
            1980 => GetIp,
            1981 => SetRpcDevice,
            1982 => DisableCacheKeygen,
            1983 => EnableCacheKeygen,
            1984 => UseIncomingDeviceUuids,
            1985 => UseIncomingMasterUuids,
            _ => return None,
        };
        Some(func)
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Key generation, load and import all produce a new key on one device
    pub fn creates_key(self) -> bool {
        matches!(
            self,
            Self::PkeyGenerateRsa
                | Self::PkeyGenerateEc
                | Self::PkeyGenerateHashsig
                | Self::PkeyLoad
                | Self::PkeyImport
        )
    }
}

/// HAL status codes as reported by the alpha firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum HalError {
    Ok = 0,
    BadArguments = 1,
    UnsupportedKey = 2,
    IoSetupFailed = 3,
    IoTimeout = 4,
    IoUnexpected = 5,
    IoOsError = 6,
    IoBadCount = 7,
    CsprngBroken = 8,
    KeywrapBadMagic = 9,
    KeywrapBadLength = 10,
    KeywrapBadPadding = 11,
    Impossible = 12,
    AllocationFailure = 13,
    ResultTooLong = 14,
    Asn1ParseFailed = 15,
    KeyNotOnCurve = 16,
    InvalidSignature = 17,
    CoreNotFound = 18,
    CoreBusy = 19,
    KeystoreAccess = 20,
    KeyNotFound = 21,
    KeyNameInUse = 22,
    NoKeySlotsAvailable = 23,
    PinIncorrect = 24,
    NoClientSlotsAvailable = 25,
    Forbidden = 26,
    XdrBufferOverflow = 27,
    RpcTransport = 28,
    RpcPacketOverflow = 29,
    RpcBadFunction = 30,
    KeyNameTooLong = 31,
    MasterkeyNotSet = 32,
    MasterkeyFail = 33,
    MasterkeyBadLength = 34,
    KsDriverNotFound = 35,
    KeystoreBadCrc = 36,
    KeystoreBadBlockType = 37,
    KeystoreLostData = 38,
    BadAttributeLength = 39,
    AttributeNotFound = 40,
    NoKeyIndexSlots = 41,
    KsIndexUuidMisordered = 42,
    KeystoreWrongBlockType = 43,
    RpcProtocolError = 44,
    NotImplemented = 45,
    CoreReassigned = 46,
    AssertionFailed = 47,
    HashsigKeyExhausted = 48,
    NotReady = 49,
    Tamper = 50,
}

impl HalError {
    const ALL: [HalError; 51] = [
        Self::Ok,
        Self::BadArguments,
        Self::UnsupportedKey,
        Self::IoSetupFailed,
        Self::IoTimeout,
        Self::IoUnexpected,
        Self::IoOsError,
        Self::IoBadCount,
        Self::CsprngBroken,
        Self::KeywrapBadMagic,
        Self::KeywrapBadLength,
        Self::KeywrapBadPadding,
        Self::Impossible,
        Self::AllocationFailure,
        Self::ResultTooLong,
        Self::Asn1ParseFailed,
        Self::KeyNotOnCurve,
        Self::InvalidSignature,
        Self::CoreNotFound,
        Self::CoreBusy,
        Self::KeystoreAccess,
        Self::KeyNotFound,
        Self::KeyNameInUse,
        Self::NoKeySlotsAvailable,
        Self::PinIncorrect,
        Self::NoClientSlotsAvailable,
        Self::Forbidden,
        Self::XdrBufferOverflow,
        Self::RpcTransport,
        Self::RpcPacketOverflow,
        Self::RpcBadFunction,
        Self::KeyNameTooLong,
        Self::MasterkeyNotSet,
        Self::MasterkeyFail,
        Self::MasterkeyBadLength,
        Self::KsDriverNotFound,
        Self::KeystoreBadCrc,
        Self::KeystoreBadBlockType,
        Self::KeystoreLostData,
        Self::BadAttributeLength,
        Self::AttributeNotFound,
        Self::NoKeyIndexSlots,
        Self::KsIndexUuidMisordered,
        Self::KeystoreWrongBlockType,
        Self::RpcProtocolError,
        Self::NotImplemented,
        Self::CoreReassigned,
        Self::AssertionFailed,
        Self::HashsigKeyExhausted,
        Self::NotReady,
        Self::Tamper,
    ];

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Human-readable reason shown to operators
    pub fn describe(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::BadArguments => "bad arguments",
            Self::Impossible => "impossible request",
            Self::KeyNotFound => "key not found",
            Self::PinIncorrect => "PIN incorrect",
            Self::Forbidden => "forbidden",
            Self::RpcTransport => "RPC transport error",
            Self::RpcBadFunction => "unknown RPC function",
            Self::MasterkeyNotSet => "master key not set",
            Self::NotReady => "device not ready",
            Self::Tamper => "tamper detected",
            Self::IoTimeout => "I/O timeout",
            _ => "device error",
        }
    }
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {})", self.describe(), self, self.code())
    }
}

/// Key types stored on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum KeyType {
    None = 0,
    RsaPrivate = 1,
    RsaPublic = 2,
    EcPrivate = 3,
    EcPublic = 4,
    HashsigPrivate = 5,
    HashsigPublic = 6,
    HashsigLms = 7,
    HashsigLmots = 8,
}

impl KeyType {
    pub fn from_code(code: u32) -> Option<Self> {
        let key_type = match code {
            0 => Self::None,
            1 => Self::RsaPrivate,
            2 => Self::RsaPublic,
            3 => Self::EcPrivate,
            4 => Self::EcPublic,
            5 => Self::HashsigPrivate,
            6 => Self::HashsigPublic,
            7 => Self::HashsigLms,
            8 => Self::HashsigLmots,
            _ => return None,
        };
        Some(key_type)
    }

    /// Public half of a private key type; other types map to themselves
    pub fn public_variant(self) -> Self {
        match self {
            Self::RsaPrivate => Self::RsaPublic,
            Self::EcPrivate => Self::EcPublic,
            Self::HashsigPrivate => Self::HashsigPublic,
            other => other,
        }
    }

    pub fn is_private(self) -> bool {
        matches!(
            self,
            Self::RsaPrivate | Self::EcPrivate | Self::HashsigPrivate
        )
    }

    pub fn is_public(self) -> bool {
        matches!(self, Self::RsaPublic | Self::EcPublic | Self::HashsigPublic)
    }
}

impl From<KeyType> for u32 {
    fn from(key_type: KeyType) -> Self {
        key_type as u32
    }
}

impl TryFrom<u32> for KeyType {
    type Error = String;

    fn try_from(code: u32) -> std::result::Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("unknown key type {}", code))
    }
}

/// Key flag bits
pub mod key_flags {
    pub const USAGE_DIGITALSIGNATURE: u32 = 1 << 0;
    pub const USAGE_KEYENCIPHERMENT: u32 = 1 << 1;
    pub const USAGE_DATAENCIPHERMENT: u32 = 1 << 2;
    pub const TOKEN: u32 = 1 << 3;
    pub const PUBLIC: u32 = 1 << 4;
    pub const EXPORTABLE: u32 = 1 << 5;
}

/// HAL user identities accepted by LOGIN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HalUser {
    None = 0,
    Normal = 1,
    So = 2,
    Wheel = 3,
}
