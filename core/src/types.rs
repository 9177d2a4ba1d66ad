//! # Vault Value Types
//!
//! Identifiers, item stacks and vault metadata. Everything here is plain
//! data: cheap to clone, serializable with serde, and free of any locking.
//!
//! | Type          | Meaning                                               |
//! |---------------|-------------------------------------------------------|
//! | `VaultId`     | Opaque vault identifier (UUID v4)                     |
//! | `ActorId`     | A viewer / player (UUID)                              |
//! | `OwnerId`     | The owning guild; at most one vault per owner         |
//! | `Material`    | Normalized item type, e.g. `IRON_INGOT`               |
//! | `ItemStack`   | Material + positive amount                            |
//! | `SlotContent` | `Option<ItemStack>`; `None` is an empty slot          |

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{VaultError, VaultResult};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// A fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Raw 16-byte form, used as a storage key prefix.
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Identifies one vault.
    VaultId
);

uuid_id!(
    /// Identifies a viewer: whoever opens the vault and clicks in it.
    ActorId
);

/// Identifies the owning guild. Free-form, assigned by the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// Material & ItemStack
// ---------------------------------------------------------------------------

/// An item type in upper snake case (`"iron ingot"` → `IRON_INGOT`).
///
/// Two stacks can merge only if their materials compare equal, so the name is
/// normalized once at construction and never again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Material(String);

impl Material {
    /// Normalizes and validates a material name.
    pub fn new(name: &str) -> VaultResult<Self> {
        let normalized: String = name
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '-' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();

        if normalized.is_empty() {
            return Err(VaultError::InvalidAction(
                "material name must not be empty".to_string(),
            ));
        }
        if !normalized
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(VaultError::InvalidAction(format!(
                "material name '{name}' contains invalid characters"
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Material {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Material {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Material::new(s)
    }
}

impl TryFrom<String> for Material {
    type Error = VaultError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Material::new(&s)
    }
}

impl From<Material> for String {
    fn from(m: Material) -> Self {
        m.0
    }
}

/// A stack of one material. `amount` is always at least 1; an empty slot is
/// `None`, never a zero-amount stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemStack {
    pub material: Material,
    pub amount: u32,
}

impl ItemStack {
    pub fn new(material: Material, amount: u32) -> VaultResult<Self> {
        if amount == 0 {
            return Err(VaultError::InvalidAction(
                "item stack amount must be positive".to_string(),
            ));
        }
        Ok(Self { material, amount })
    }

    /// Same material, different amount. Zero yields an empty slot.
    pub fn with_amount(&self, amount: u32) -> SlotContent {
        (amount > 0).then(|| Self {
            material: self.material.clone(),
            amount,
        })
    }

    /// Whether `other` could merge into this stack.
    pub fn is_similar(&self, other: &ItemStack) -> bool {
        self.material == other.material
    }
}

impl fmt::Display for ItemStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x {}", self.amount, self.material)
    }
}

/// The contents of one slot.
pub type SlotContent = Option<ItemStack>;

// ---------------------------------------------------------------------------
// Placement
// ---------------------------------------------------------------------------

/// Where a vault's structure stands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub world: String,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Location {
    pub fn new(world: impl Into<String>, x: i32, y: i32, z: i32) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}, {}, {}", self.world, self.x, self.y, self.z)
    }
}

/// Rotation of the formed structure relative to its template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    #[default]
    None,
    Clockwise90,
    Clockwise180,
    Clockwise270,
}

impl Orientation {
    pub fn degrees(self) -> u16 {
        match self {
            Orientation::None => 0,
            Orientation::Clockwise90 => 90,
            Orientation::Clockwise180 => 180,
            Orientation::Clockwise270 => 270,
        }
    }
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// Registry metadata for one vault. Slot contents live in the slot store,
/// not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    pub id: VaultId,
    pub owner: OwnerId,
    pub created_by: ActorId,
    pub location: Location,
    pub orientation: Orientation,
    pub created_at: DateTime<Utc>,
    pub slot_count: usize,
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

/// What one viewer may do inside one open vault.
///
/// Resolved by the host when the vault is opened and attached to that
/// viewer's handle; other viewers of the same vault carry their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permissions {
    pub can_deposit: bool,
    pub can_withdraw: bool,
}

impl Permissions {
    pub const NONE: Permissions = Permissions {
        can_deposit: false,
        can_withdraw: false,
    };

    pub const FULL: Permissions = Permissions {
        can_deposit: true,
        can_withdraw: true,
    };

    pub const DEPOSIT_ONLY: Permissions = Permissions {
        can_deposit: true,
        can_withdraw: false,
    };

    pub const WITHDRAW_ONLY: Permissions = Permissions {
        can_deposit: false,
        can_withdraw: true,
    };

    /// Viewing requires at least one of the two rights.
    pub fn can_view(self) -> bool {
        self.can_deposit || self.can_withdraw
    }

    /// Whether every right in `required` is held.
    pub fn allows(self, required: Permissions) -> bool {
        (!required.can_deposit || self.can_deposit)
            && (!required.can_withdraw || self.can_withdraw)
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.can_deposit, self.can_withdraw) {
            (true, true) => f.write_str("deposit, withdraw"),
            (true, false) => f.write_str("deposit"),
            (false, true) => f.write_str("withdraw"),
            (false, false) => f.write_str("none"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn material_names_are_normalized() {
        assert_eq!(Material::new("iron ingot").unwrap().as_str(), "IRON_INGOT");
        assert_eq!(Material::new(" oak-log ").unwrap().as_str(), "OAK_LOG");
        assert_eq!(
            Material::new("DIAMOND").unwrap(),
            Material::new("diamond").unwrap()
        );
    }

    #[test]
    fn material_rejects_garbage() {
        assert!(Material::new("").is_err());
        assert!(Material::new("   ").is_err());
        assert!(Material::new("iron/ingot").is_err());
    }

    #[test]
    fn material_deserialization_normalizes() {
        let m: Material = serde_json::from_str("\"gold ingot\"").unwrap();
        assert_eq!(m.as_str(), "GOLD_INGOT");
        assert!(serde_json::from_str::<Material>("\"\"").is_err());
    }

    #[test]
    fn zero_amount_stack_is_rejected() {
        let m = Material::new("DIRT").unwrap();
        assert!(ItemStack::new(m.clone(), 0).is_err());
        let stack = ItemStack::new(m, 5).unwrap();
        assert_eq!(stack.with_amount(0), None);
        assert_eq!(stack.with_amount(3).map(|s| s.amount), Some(3));
    }

    #[test]
    fn stacks_compare_by_material_and_amount() {
        let dirt = Material::new("DIRT").unwrap();
        let stone = Material::new("STONE").unwrap();
        let a = ItemStack::new(dirt.clone(), 5).unwrap();
        let b = ItemStack::new(dirt, 6).unwrap();
        let c = ItemStack::new(stone, 5).unwrap();
        assert_ne!(a, b);
        assert!(a.is_similar(&b));
        assert!(!a.is_similar(&c));
    }

    #[test]
    fn ids_roundtrip_through_strings_and_bytes() {
        let id = VaultId::new();
        let parsed: VaultId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(VaultId::from_bytes(*id.as_bytes()), id);
        assert!("not-a-uuid".parse::<ActorId>().is_err());
    }

    #[test]
    fn permissions_allow_subsets() {
        assert!(Permissions::FULL.allows(Permissions::DEPOSIT_ONLY));
        assert!(Permissions::FULL.allows(Permissions::FULL));
        assert!(!Permissions::DEPOSIT_ONLY.allows(Permissions::WITHDRAW_ONLY));
        assert!(!Permissions::WITHDRAW_ONLY.allows(Permissions::FULL));
        assert!(Permissions::NONE.allows(Permissions::NONE));
        assert!(!Permissions::NONE.can_view());
        assert_eq!(Permissions::FULL.to_string(), "deposit, withdraw");
    }

    #[test]
    fn orientation_degrees() {
        assert_eq!(Orientation::default().degrees(), 0);
        assert_eq!(Orientation::Clockwise270.degrees(), 270);
    }
}
