use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use rand::distr::Alphanumeric;
use rand::distr::SampleString;
use serde::Deserialize;
use serde::Serialize;
use sha3::Digest;
use sha3::Sha3_256;
use tracing::debug;

use crate::models::node::Address;

const WALLET_FILE_VERSION: u8 = 1;
const SECRET_LENGTH: usize = 52;
const ADDRESS_PREFIX: &str = "wc1";
const ADDRESS_HEX_DIGITS: usize = 40;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct WalletKey {
    secret: String,

    /// handed out as an address, or imported. Unused keys form the keypool.
    used: bool,
}

/// The content of the wallet store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct WalletFile {
    version: u8,
    keys: Vec<WalletKey>,
}

/// A key-only wallet. Funds are never stored: a balance is whatever the
/// chain holds for the wallet's addresses.
///
/// Keys are generated ahead of use and kept in a keypool, in the order they
/// will be handed out, so a copy of the wallet store also knows the
/// addresses the live wallet will produce next.
#[derive(Debug, Clone)]
pub struct Wallet {
    path: PathBuf,
    keypool_size: usize,
    keys: Vec<WalletKey>,
    addresses: HashSet<Address>,
}

impl Wallet {
    /// The address controlled by `secret`.
    pub fn address_of(secret: &str) -> Address {
        let digest = format!("{:x}", Sha3_256::digest(secret.as_bytes()));
        Address(format!("{ADDRESS_PREFIX}{}", &digest[..ADDRESS_HEX_DIGITS]))
    }

    /// Read the wallet store at `path`, or create a fresh wallet there.
    pub async fn load_or_create(path: PathBuf, keypool_size: usize) -> Result<Self> {
        let keys = if tokio::fs::try_exists(&path).await? {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read wallet {}", path.display()))?;
            let file: WalletFile = bincode::deserialize(&bytes)
                .with_context(|| format!("Corrupt wallet {}", path.display()))?;
            ensure!(
                file.version == WALLET_FILE_VERSION,
                "Unsupported wallet version {}",
                file.version
            );
            debug!("loaded wallet {} with {} keys", path.display(), file.keys.len());
            file.keys
        } else {
            debug!("creating new wallet {}", path.display());
            vec![]
        };

        let addresses = keys.iter().map(|k| Self::address_of(&k.secret)).collect();
        let mut wallet = Self {
            path,
            keypool_size,
            keys,
            addresses,
        };
        wallet.top_up_keypool();
        wallet.persist().await?;
        Ok(wallet)
    }

    fn add_key(&mut self, secret: String, used: bool) {
        self.addresses.insert(Self::address_of(&secret));
        self.keys.push(WalletKey { secret, used });
    }

    fn top_up_keypool(&mut self) {
        let mut rng = rand::rng();
        while self.keypool_len() < self.keypool_size {
            let secret = Alphanumeric.sample_string(&mut rng, SECRET_LENGTH);
            self.add_key(secret, false);
        }
    }

    pub fn keypool_len(&self) -> usize {
        self.keys.iter().filter(|k| !k.used).count()
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn owns(&self, address: &Address) -> bool {
        self.addresses.contains(address)
    }

    /// Take the oldest key from the keypool.
    pub async fn new_address(&mut self) -> Result<Address> {
        self.top_up_keypool();
        let Some(key) = self.keys.iter_mut().find(|k| !k.used) else {
            bail!("keypool is empty");
        };
        key.used = true;
        let address = Self::address_of(&key.secret);

        self.top_up_keypool();
        self.persist().await?;
        Ok(address)
    }

    /// Write the wallet store.
    pub async fn persist(&self) -> Result<()> {
        let file = WalletFile {
            version: WALLET_FILE_VERSION,
            keys: self.keys.clone(),
        };
        let bytes = bincode::serialize(&file)?;

        // write-then-rename so a concurrent copy never sees a partial store
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write wallet {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Copy the wallet store, byte for byte, to `destination`.
    pub async fn backup_to(&self, destination: &Path) -> Result<()> {
        self.persist().await?;
        tokio::fs::copy(&self.path, destination)
            .await
            .with_context(|| format!("Failed to back up wallet to {}", destination.display()))?;
        Ok(())
    }

    /// Every secret as text, one per line, keypool included.
    pub fn dump(&self) -> String {
        let mut text = String::from("# Wallet dump created by walletcheck\n");
        for key in &self.keys {
            let label = if key.used { "label=" } else { "reserve=1" };
            text.push_str(&format!(
                "{} {label} # addr={}\n",
                key.secret,
                Self::address_of(&key.secret)
            ));
        }
        text.push_str("# End of dump\n");
        text
    }

    pub async fn dump_to(&self, destination: &Path) -> Result<()> {
        tokio::fs::write(destination, self.dump())
            .await
            .with_context(|| format!("Failed to write dump {}", destination.display()))
    }

    /// Secrets listed in a dump.
    pub fn parse_dump(text: &str) -> Result<Vec<String>> {
        text.lines()
            .enumerate()
            .map(|(n, line)| (n, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
            .map(|(n, line)| {
                let secret = line.split_whitespace().next().unwrap_or_default();
                ensure!(
                    secret.len() == SECRET_LENGTH
                        && secret.chars().all(|c| c.is_ascii_alphanumeric()),
                    "malformed key on line {}",
                    n + 1
                );
                Ok(secret.to_string())
            })
            .collect()
    }

    /// Add every secret of the dump at `path`. Returns the number of keys
    /// that were new to this wallet.
    pub async fn import_from(&mut self, path: &Path) -> Result<usize> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read dump {}", path.display()))?;
        let secrets = Self::parse_dump(&text)?;

        let known: HashSet<String> = self.keys.iter().map(|k| k.secret.clone()).collect();
        let mut added = 0;
        for secret in secrets {
            if !known.contains(&secret) && !self.owns(&Self::address_of(&secret)) {
                self.add_key(secret, true);
                added += 1;
            }
        }
        self.persist().await?;
        debug!("imported {added} keys from {}", path.display());
        Ok(added)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config_models::data_directory::DataDirectory;
    use crate::config_models::network::Network;
    use crate::models::node::NodeIndex;
    use crate::tests::shared::unit_test_data_directory;

    async fn wallet_in_fresh_dir(keypool_size: usize) -> (Wallet, DataDirectory) {
        let data_dir = unit_test_data_directory(Network::RegTest).unwrap();
        let node = data_dir.node(NodeIndex(0));
        DataDirectory::create_dir_if_not_exists(&node.network_dir_path())
            .await
            .unwrap();
        let wallet = Wallet::load_or_create(node.wallet_file_path(), keypool_size)
            .await
            .unwrap();
        (wallet, data_dir)
    }

    #[tokio::test]
    async fn backup_knows_addresses_handed_out_later() {
        let (mut wallet, data_dir) = wallet_in_fresh_dir(10).await;
        let backup = data_dir.root_dir_path().join("wallet.bak");
        wallet.backup_to(&backup).await.unwrap();

        let later = wallet.new_address().await.unwrap();
        let restored = Wallet::load_or_create(backup, 10).await.unwrap();
        assert!(restored.owns(&later));
    }

    #[tokio::test]
    async fn keypool_is_refilled() {
        let (mut wallet, _data_dir) = wallet_in_fresh_dir(3).await;
        for _ in 0..5 {
            wallet.new_address().await.unwrap();
            assert_eq!(3, wallet.keypool_len());
        }
        assert_eq!(8, wallet.key_count());
    }

    #[tokio::test]
    async fn import_of_dump_restores_every_address() {
        let (mut wallet, data_dir) = wallet_in_fresh_dir(4).await;
        let used = wallet.new_address().await.unwrap();
        let dump = data_dir.root_dir_path().join("wallet.dump");
        wallet.dump_to(&dump).await.unwrap();

        let other = data_dir.node(NodeIndex(1));
        DataDirectory::create_dir_if_not_exists(&other.network_dir_path())
            .await
            .unwrap();
        let mut fresh = Wallet::load_or_create(other.wallet_file_path(), 4)
            .await
            .unwrap();
        assert!(!fresh.owns(&used));

        assert_eq!(5, fresh.import_from(&dump).await.unwrap());
        assert!(fresh.owns(&used));

        // importing twice adds nothing
        assert_eq!(0, fresh.import_from(&dump).await.unwrap());
    }

    #[test]
    fn malformed_dump_is_rejected() {
        assert!(Wallet::parse_dump("# only comments\n\n").unwrap().is_empty());
        assert!(Wallet::parse_dump("not-a-key label=\n").is_err());
    }
}
