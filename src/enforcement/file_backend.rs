use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;

use super::rules::{apply_update, EnforcementResult, EnforcementRule, RuleBackend};

/// Rule set kept as a JSON array on disk.
///
/// The file is in the browser's dynamic rule format so an extension shim can
/// load it verbatim.
pub struct FileRuleBackend {
    path: PathBuf,
    io_lock: Mutex<()>,
}

impl FileRuleBackend {
    pub async fn open(path: impl AsRef<Path>) -> EnforcementResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(Self {
            path,
            io_lock: Mutex::new(()),
        })
    }

    async fn read(&self) -> EnforcementResult<BTreeMap<u32, EnforcementRule>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(BTreeMap::new());
        }

        let rules: Vec<EnforcementRule> = serde_json::from_slice(&bytes)?;
        Ok(rules.into_iter().map(|r| (r.id, r)).collect())
    }

    async fn write(&self, rules: &BTreeMap<u32, EnforcementRule>) -> EnforcementResult<()> {
        let list: Vec<&EnforcementRule> = rules.values().collect();
        let json = serde_json::to_vec_pretty(&list)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl RuleBackend for FileRuleBackend {
    async fn list_rules(&self) -> EnforcementResult<Vec<EnforcementRule>> {
        let _guard = self.io_lock.lock().await;
        Ok(self.read().await?.into_values().collect())
    }

    async fn update_rules(&self, remove_ids: &[u32], add_rules: Vec<EnforcementRule>) -> EnforcementResult<()> {
        let _guard = self.io_lock.lock().await;
        let mut rules = self.read().await?;
        apply_update(&mut rules, remove_ids, add_rules)?;
        self.write(&rules).await
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
