use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use spl_associated_token_account::get_associated_token_address;

use crate::error::{BotError, BotResult};

/// A signing wallet loaded at startup.
///
/// The keypair never leaves this struct except as a shared reference for
/// transaction signing. Associated token accounts are derived once per mint
/// and memoized.
pub struct Wallet {
    pub name: String,
    keypair: Arc<Keypair>,
    pubkey: Pubkey,
    ata_cache: DashMap<Pubkey, Pubkey>,
}

impl Wallet {
    /// Build a wallet from a base58 encoded 64-byte secret key
    pub fn from_base58(name: &str, private_key: &str) -> BotResult<Self> {
        let bytes = bs58::decode(private_key.trim())
            .into_vec()
            .map_err(|e| BotError::Validation(format!("wallet '{}': invalid base58 key: {}", name, e)))?;

        let keypair = Keypair::try_from(&bytes[..])
            .map_err(|e| BotError::Validation(format!("wallet '{}': invalid keypair bytes: {}", name, e)))?;

        Ok(Self::from_keypair(name, keypair))
    }

    pub fn from_keypair(name: &str, keypair: Keypair) -> Self {
        let pubkey = keypair.pubkey();
        Self {
            name: name.to_string(),
            keypair: Arc::new(keypair),
            pubkey,
            ata_cache: DashMap::new(),
        }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.pubkey
    }

    pub fn keypair(&self) -> Arc<Keypair> {
        Arc::clone(&self.keypair)
    }

    /// Associated token account of this wallet for `mint`
    pub fn ata_for(&self, mint: &Pubkey) -> Pubkey {
        *self
            .ata_cache
            .entry(*mint)
            .or_insert_with(|| get_associated_token_address(&self.pubkey, mint))
    }
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("name", &self.name)
            .field("pubkey", &self.pubkey)
            .finish_non_exhaustive()
    }
}

/// Wallets by name, immutable once built
#[derive(Debug, Default)]
pub struct WalletStore {
    wallets: HashMap<String, Arc<Wallet>>,
    order: Vec<String>,
}

impl WalletStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later wallets with the same name replace earlier ones
    pub fn insert(&mut self, wallet: Wallet) {
        let name = wallet.name.clone();
        if self.wallets.insert(name.clone(), Arc::new(wallet)).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Wallet>> {
        self.wallets.get(name).cloned()
    }

    /// First wallet in file order, used when a lookup has nothing better
    pub fn default_wallet(&self) -> Option<Arc<Wallet>> {
        self.order.first().and_then(|name| self.get(name))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base58_round_trip_derives_pubkey() {
        let keypair = Keypair::new();
        let expected = keypair.pubkey();
        let encoded = bs58::encode(keypair.to_bytes()).into_string();

        let wallet = Wallet::from_base58("main", &encoded).unwrap();
        assert_eq!(wallet.pubkey(), expected);
        assert!(!format!("{:?}", wallet).contains(&encoded));
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(Wallet::from_base58("bad", "not-base58-0OIl").is_err());
        assert!(Wallet::from_base58("short", "3yZe7d").is_err());
    }

    #[test]
    fn test_ata_memoized() {
        let wallet = Wallet::from_keypair("main", Keypair::new());
        let mint = Pubkey::new_unique();
        let first = wallet.ata_for(&mint);
        assert_eq!(first, get_associated_token_address(&wallet.pubkey(), &mint));
        assert_eq!(wallet.ata_for(&mint), first);
        assert_eq!(wallet.ata_cache.len(), 1);
    }

    #[test]
    fn test_duplicate_names_overwrite() {
        let mut store = WalletStore::new();
        let first = Wallet::from_keypair("main", Keypair::new());
        let second = Wallet::from_keypair("main", Keypair::new());
        let second_key = second.pubkey();
        store.insert(first);
        store.insert(second);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("main").unwrap().pubkey(), second_key);
        assert_eq!(store.default_wallet().unwrap().pubkey(), second_key);
    }
}
