//! Character Storage Contract
//!
//! Characters live outside the server. Sessions only load a sheet when the
//! game starts and save the accumulated inventory when it ends.

use std::collections::BTreeMap;
use std::sync::RwLock;
use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::game::state::{Inventory, StatBlock, UserId};

/// A stored player character.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterSheet {
    /// Character identifier.
    pub id: String,
    /// Owning account.
    pub owner: UserId,
    /// Character name.
    pub name: String,
    /// Base stats.
    pub stats: StatBlock,
    /// Persistent inventory.
    pub inventory: Inventory,
}

/// Storage failures.
#[derive(Debug, Error)]
pub enum CharacterStoreError {
    /// The character belongs to someone else.
    #[error("character {0} is not owned by this user")]
    NotOwned(String),
    /// Backend failure.
    #[error("character storage unavailable: {0}")]
    Unavailable(String),
}

/// Load/save contract for character persistence.
pub trait CharacterStore: Send + Sync {
    /// Fetch a sheet. `Ok(None)` means the character does not exist.
    fn load(&self, owner: &UserId, character_id: &str) -> Result<Option<CharacterSheet>, CharacterStoreError>;

    /// Persist a sheet.
    fn save(&self, sheet: &CharacterSheet) -> Result<(), CharacterStoreError>;
}

/// Process-local store, used by the binary and tests.
#[derive(Default)]
pub struct InMemoryCharacterStore {
    sheets: RwLock<BTreeMap<String, CharacterSheet>>,
}

impl InMemoryCharacterStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CharacterStore for InMemoryCharacterStore {
    fn load(&self, owner: &UserId, character_id: &str) -> Result<Option<CharacterSheet>, CharacterStoreError> {
        let sheets = self.sheets.read().map_err(|e| CharacterStoreError::Unavailable(e.to_string()))?;
        match sheets.get(character_id) {
            Some(sheet) if &sheet.owner != owner => Err(CharacterStoreError::NotOwned(character_id.to_string())),
            Some(sheet) => Ok(Some(sheet.clone())),
            None => Ok(None),
        }
    }

    fn save(&self, sheet: &CharacterSheet) -> Result<(), CharacterStoreError> {
        let mut sheets = self.sheets.write().map_err(|e| CharacterStoreError::Unavailable(e.to_string()))?;
        sheets.insert(sheet.id.clone(), sheet.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet(owner: &str) -> CharacterSheet {
        CharacterSheet {
            id: "hero-1".into(),
            owner: UserId::from(owner),
            name: "Hero".into(),
            stats: StatBlock::new(20, 5, 2, 3, 4, 1),
            inventory: Inventory::new(),
        }
    }

    #[test]
    fn test_save_and_load() {
        let store = InMemoryCharacterStore::new();
        store.save(&sheet("alice")).unwrap();

        let loaded = store.load(&UserId::from("alice"), "hero-1").unwrap();
        assert_eq!(loaded.unwrap().name, "Hero");
        assert!(store.load(&UserId::from("alice"), "missing").unwrap().is_none());
    }

    #[test]
    fn test_foreign_character_rejected() {
        let store = InMemoryCharacterStore::new();
        store.save(&sheet("alice")).unwrap();

        let result = store.load(&UserId::from("mallory"), "hero-1");
        assert!(matches!(result, Err(CharacterStoreError::NotOwned(_))));
    }
}
