use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{FeatureError, Result};
use crate::eval::Parameters;
use crate::feature::Flag;
use crate::jsonutil::HtmlUnescaper;

/// Result of [`Registry::list`].
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureList {
    pub names: Vec<String>,
    /// `None` when only names were requested.
    pub flags: Option<Vec<Flag>>,
}

/// Result of [`Registry::set`].
#[derive(Debug, Clone, PartialEq)]
pub struct SetOutcome {
    pub before: Option<Flag>,
    pub after: Flag,
}

/// The watch session currently attached to a registry.
pub(crate) struct ActiveWatch {
    pub(crate) path: PathBuf,
    pub(crate) modified: mpsc::Sender<()>,
}

/// Concurrent store of named flags.
///
/// Readers receive owned copies. Mutations made through [`Registry::set`] and
/// [`Registry::delete`] notify the attached watch session, if any, which writes
/// the new state back to disk.
#[derive(Default)]
pub struct Registry {
    features: RwLock<HashMap<String, Arc<Flag>>>,
    watch: Mutex<Option<ActiveWatch>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from `features`, validating every entry first.
    pub fn from_features(features: HashMap<String, Flag>) -> Result<Self> {
        let registry = Self::new();
        registry.reload(features)?;
        Ok(registry)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Flag>>> {
        self.features.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Flag>>> {
        self.features.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, name: &str) -> Result<Arc<Flag>> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| FeatureError::NotFound(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Result<Flag> {
        self.lookup(name).map(|flag| flag.as_ref().clone())
    }

    pub fn list(&self, names_only: bool) -> FeatureList {
        let features = self.read();
        let mut names: Vec<String> = features.keys().cloned().collect();
        names.sort();
        let flags = if names_only {
            None
        } else {
            Some(
                names
                    .iter()
                    .filter_map(|name| features.get(name))
                    .map(|flag| flag.as_ref().clone())
                    .collect(),
            )
        };
        FeatureList { names, flags }
    }

    /// Inserts or fully replaces a flag.
    pub fn set(&self, flag: Flag) -> Result<SetOutcome> {
        flag.validate()?;
        let before = self
            .write()
            .insert(flag.name().to_string(), Arc::new(flag.clone()))
            .map(|old| old.as_ref().clone());
        debug!(feature = flag.name(), replaced = before.is_some(), "feature set");
        self.signal_modified();
        Ok(SetOutcome {
            before,
            after: flag,
        })
    }

    pub fn delete(&self, name: &str) -> Option<Flag> {
        let removed = self.write().remove(name).map(|old| old.as_ref().clone());
        if removed.is_some() {
            debug!(feature = name, "feature deleted");
            self.signal_modified();
        }
        removed
    }

    /// Replaces the whole contents with `features`. The map key is the
    /// flag's name. Nothing changes unless every entry validates.
    pub fn reload<I>(&self, features: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Flag)>,
    {
        // validated in key order, so the first bad flag is always the one reported
        let ordered: BTreeMap<String, Flag> = features.into_iter().collect();
        let mut next = HashMap::with_capacity(ordered.len());
        for (name, flag) in ordered {
            let flag = flag.with_name(name.clone());
            flag.validate()?;
            next.insert(name, Arc::new(flag));
        }
        let count = next.len();
        *self.write() = next;
        info!(count, "features reloaded");
        Ok(())
    }

    pub fn snapshot(&self) -> BTreeMap<String, Flag> {
        self.read()
            .iter()
            .map(|(name, flag)| (name.clone(), flag.as_ref().clone()))
            .collect()
    }

    /// Evaluates the named flag. The registry lock is not held while the
    /// flag is evaluated.
    pub fn is_enabled(&self, name: &str, params: &Parameters) -> Result<bool> {
        let flag = self.lookup(name)?;
        flag.is_enabled_for(params)
    }

    /// Reads `path` and replaces the registry contents with it.
    pub fn load_file(&self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)?;
        self.reload_from_slice(&bytes, path)
    }

    /// Decodes a JSON object of flags keyed by name and reloads from it.
    /// `origin` names the source in errors.
    pub fn reload_from_slice(&self, bytes: &[u8], origin: &Path) -> Result<()> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(FeatureError::EmptyConfig(origin.to_path_buf()));
        }
        let features: HashMap<String, Flag> = serde_json::from_slice(bytes)?;
        self.reload(features)
    }

    /// Pretty-printed JSON of the current contents, in the on-disk format.
    pub fn encode_snapshot(&self) -> Result<Vec<u8>> {
        let mut encoded = serde_json::to_vec_pretty(&self.snapshot())?;
        encoded.push(b'\n');
        let mut out = Vec::with_capacity(encoded.len());
        HtmlUnescaper::new(encoded).read_to_end(&mut out)?;
        Ok(out)
    }

    /// Path of the file currently being watched, if any.
    pub fn watched_path(&self) -> Option<PathBuf> {
        self.watch_slot().as_ref().map(|active| active.path.clone())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub(crate) fn watch_slot(&self) -> MutexGuard<'_, Option<ActiveWatch>> {
        self.watch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clears the watch slot if it still belongs to the session owning `modified`.
    pub(crate) fn end_watch(&self, modified: &mpsc::Sender<()>) {
        let mut slot = self.watch_slot();
        if slot
            .as_ref()
            .is_some_and(|active| active.modified.same_channel(modified))
        {
            *slot = None;
        }
    }

    /// Never blocks; a full channel already has a write-back queued.
    fn signal_modified(&self) {
        if let Some(active) = self.watch_slot().as_ref() {
            let _ = active.modified.try_send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Value;
    use crate::error::InvalidReason;
    use crate::feature::FeatureType;

    fn sample() -> Registry {
        Registry::from_features(HashMap::from([
            ("beta".to_string(), Flag::constant("", true)),
            ("rollout".to_string(), Flag::percentage_based("", 30)),
            (
                "premium".to_string(),
                Flag::expression_based("", "plan == \"pro\" and seats > 5"),
            ),
        ]))
        .unwrap()
    }

    fn attach(registry: &Registry) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        *registry.watch_slot() = Some(ActiveWatch {
            path: PathBuf::from("/tmp/features.json"),
            modified: tx,
        });
        rx
    }

    #[test]
    fn test_get() {
        let registry = sample();
        let beta = registry.get("beta").unwrap();
        assert_eq!(beta.name(), "beta");
        assert_eq!(beta.kind(), FeatureType::Constant);

        let err = registry.get("missing").unwrap_err();
        assert!(matches!(err, FeatureError::NotFound(_)));
        assert_eq!(err.to_string(), "no such feature with name missing");
    }

    #[test]
    fn test_list_is_sorted() {
        let registry = sample();
        let names_only = registry.list(true);
        assert_eq!(names_only.names, vec!["beta", "premium", "rollout"]);
        assert!(names_only.flags.is_none());

        let full = registry.list(false);
        let flags = full.flags.unwrap();
        let names: Vec<&str> = flags.iter().map(Flag::name).collect();
        assert_eq!(names, vec!["beta", "premium", "rollout"]);
    }

    #[test]
    fn test_set_reports_before_and_after() {
        let registry = sample();
        let outcome = registry.set(Flag::constant("beta", false)).unwrap();
        assert_eq!(outcome.before, Some(Flag::constant("beta", true)));
        assert_eq!(outcome.after, Flag::constant("beta", false));

        let outcome = registry.set(Flag::constant("fresh", true)).unwrap();
        assert!(outcome.before.is_none());
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_invalid_set_leaves_registry_unchanged() {
        let registry = sample();
        let before = registry.snapshot();

        let err = registry.set(Flag::percentage_based("rollout", 101)).unwrap_err();
        assert!(err.is_invalid());
        assert!(matches!(
            err,
            FeatureError::InvalidFeature {
                reason: InvalidReason::PercentageOutOfRange(101),
                ..
            }
        ));
        let err = registry.set(Flag::new("mystery", FeatureType::Unknown)).unwrap_err();
        assert!(err.is_invalid());

        assert_eq!(registry.snapshot(), before);
    }

    #[test]
    fn test_reload_is_all_or_nothing() {
        let registry = sample();
        let before = registry.snapshot();

        let err = registry
            .reload([
                ("a".to_string(), Flag::constant("", true)),
                ("b".to_string(), Flag::percentage_based("", -1)),
            ])
            .unwrap_err();
        assert!(err.is_invalid());
        assert_eq!(registry.snapshot(), before);

        for _ in 0..8 {
            let err = registry
                .reload(HashMap::from([
                    ("zeta".to_string(), Flag::expression_based("", "")),
                    ("mid".to_string(), Flag::constant("", true)),
                    ("alpha".to_string(), Flag::percentage_based("", 101)),
                    ("omega".to_string(), Flag::new("", FeatureType::Unknown)),
                ]))
                .unwrap_err();
            assert!(
                matches!(err, FeatureError::InvalidFeature { ref name, .. } if name == "alpha"),
                "{err}"
            );
        }

        registry
            .reload([("only".to_string(), Flag::constant("ignored", true))])
            .unwrap();
        assert_eq!(registry.list(true).names, vec!["only"]);
        assert_eq!(registry.get("only").unwrap().name(), "only");
    }

    #[test]
    fn test_mutations_signal_write_back() {
        let registry = sample();
        let mut rx = attach(&registry);

        registry.set(Flag::constant("beta", false)).unwrap();
        registry.set(Flag::constant("beta", true)).unwrap();
        assert!(rx.try_recv().is_ok());
        // coalesced into one pending signal
        assert!(rx.try_recv().is_err());

        assert!(registry.delete("missing").is_none());
        assert!(rx.try_recv().is_err());

        assert!(registry.delete("beta").is_some());
        assert!(rx.try_recv().is_ok());

        registry
            .reload([("x".to_string(), Flag::constant("", true))])
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_end_watch_only_clears_own_session() {
        let registry = Registry::new();
        let _rx = attach(&registry);
        let (other, _other_rx) = mpsc::channel(1);

        registry.end_watch(&other);
        assert_eq!(
            registry.watched_path(),
            Some(PathBuf::from("/tmp/features.json"))
        );

        let own = registry.watch_slot().as_ref().unwrap().modified.clone();
        registry.end_watch(&own);
        assert!(registry.watched_path().is_none());
    }

    #[test]
    fn test_is_enabled() {
        let registry = sample();
        let params = Parameters::from([
            ("plan".to_string(), Value::from("pro")),
            ("seats".to_string(), Value::from(10)),
        ]);
        assert!(registry.is_enabled("premium", &params).unwrap());
        assert!(registry.is_enabled("beta", &Parameters::new()).unwrap());
        assert!(matches!(
            registry.is_enabled("premium", &Parameters::new()),
            Err(FeatureError::Evaluation { .. })
        ));
        assert!(matches!(
            registry.is_enabled("nope", &params),
            Err(FeatureError::NotFound(_))
        ));
    }

    #[test]
    fn test_reload_from_slice() {
        let registry = sample();
        let origin = Path::new("features.json");

        let err = registry.reload_from_slice(b"  \n", origin).unwrap_err();
        assert!(matches!(err, FeatureError::EmptyConfig(_)));
        let err = registry.reload_from_slice(b"{not json", origin).unwrap_err();
        assert!(matches!(err, FeatureError::Decode(_)));
        assert_eq!(registry.len(), 3);

        registry
            .reload_from_slice(
                br#"{"dark": {"type": "CONSTANT", "enabled": true, "description": "UI"}}"#,
                origin,
            )
            .unwrap();
        let dark = registry.get("dark").unwrap();
        assert!(dark.enabled());
        assert_eq!(dark.description(), "UI");
    }

    #[test]
    fn test_encode_snapshot() {
        let registry = Registry::from_features(HashMap::from([(
            "gate".to_string(),
            Flag::expression_based("", "age >= 18 && country != \"NZ\""),
        )]))
        .unwrap();

        let encoded = String::from_utf8(registry.encode_snapshot().unwrap()).unwrap();
        assert!(encoded.ends_with("}\n"));
        assert!(encoded.contains("age >= 18 && country"));
        assert!(encoded.contains("\n  \"gate\": {"));

        let copy = Registry::new();
        copy.reload_from_slice(encoded.as_bytes(), Path::new("copy.json"))
            .unwrap();
        assert_eq!(copy.snapshot(), registry.snapshot());
    }
}
