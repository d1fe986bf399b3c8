use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};

use log::{debug, info, warn};

use crate::{
    adapter::{
        kernel::{KernelAdapter, ObjectKind},
        schema::SchemaLibrary,
    },
    tree::Node,
};

use super::{
    ConfigSource, DatastoreError, DatastoreId,
    delta::{self, ApplyError, Delta},
    edit::{DefaultOperation, Edit, ErrorOption},
    filter::Filter,
    startup,
};

const ROOT: &str = "config";

type LockTable<'a> = MutexGuard<'a, BTreeMap<DatastoreId, LockRecord>>;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRecord {
    pub owner: u32,
    pub acquired: SystemTime,
}

/// Whether running still matches what the kernel has applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Consistency {
    #[default]
    Consistent,
    /// A failed commit could not be reverted.
    Inconsistent,
    /// Inconsistent, but the candidate has since been discarded; the next
    /// successful commit restores consistency.
    Discarded,
}

#[derive(Debug)]
struct Datastore {
    tree: Node,
    consistency: Consistency,
}

impl Datastore {
    fn empty() -> Self {
        Self {
            tree: Node::new(ROOT),
            consistency: Consistency::default(),
        }
    }
}

/// The running, candidate and startup datastores plus their lock table.
///
/// Mutexes are always taken in the order lock table, running, candidate,
/// startup, kernel.
pub struct DatastoreManager {
    locks: Mutex<BTreeMap<DatastoreId, LockRecord>>,
    running: Mutex<Datastore>,
    candidate: Mutex<Datastore>,
    startup: Mutex<Datastore>,
    kernel: Mutex<Box<dyn KernelAdapter>>,
    schema: Arc<dyn SchemaLibrary>,
    startup_path: Option<PathBuf>,
    writable_running: bool,
}

impl DatastoreManager {
    pub fn new(schema: Arc<dyn SchemaLibrary>, kernel: Box<dyn KernelAdapter>) -> Self {
        Self {
            locks: Mutex::new(BTreeMap::new()),
            running: Mutex::new(Datastore::empty()),
            candidate: Mutex::new(Datastore::empty()),
            startup: Mutex::new(Datastore::empty()),
            kernel: Mutex::new(kernel),
            schema,
            startup_path: None,
            writable_running: true,
        }
    }

    /// Persist startup to `path` on every successful commit.
    pub fn with_startup_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.startup_path = Some(path.into());
        self
    }

    pub fn with_writable_running(mut self, enabled: bool) -> Self {
        self.writable_running = enabled;
        self
    }

    pub fn writable_running(&self) -> bool {
        self.writable_running
    }

    pub fn schema(&self) -> &Arc<dyn SchemaLibrary> {
        &self.schema
    }

    /// Load the startup file and apply it to the kernel.
    pub fn boot(&self) -> Result<(), DatastoreError> {
        let Some(path) = &self.startup_path else {
            return Ok(());
        };
        let Some(text) = startup::load(path)? else {
            return Ok(());
        };

        let tree = self.schema.parse(&text).map_err(DatastoreError::Startup)?;
        self.schema.validate(&tree).map_err(DatastoreError::Startup)?;
        self.schema
            .validate_semantics(&tree)
            .map_err(DatastoreError::Startup)?;

        let mut running = guard(&self.running);
        let mut candidate = guard(&self.candidate);
        let mut startup = guard(&self.startup);
        let delta = Delta::between(&running.tree, &tree);
        self.apply_delta(&mut running, &delta)?;

        info!("booted with {} configuration changes", delta.changes.len());
        running.tree = tree.clone();
        candidate.tree = tree.clone();
        startup.tree = tree;
        Ok(())
    }

    pub fn lock_holder(&self, datastore: DatastoreId) -> Option<u32> {
        guard(&self.locks).get(&datastore).map(|r| r.owner)
    }

    pub fn lock_record(&self, datastore: DatastoreId) -> Option<LockRecord> {
        guard(&self.locks).get(&datastore).copied()
    }

    pub fn lock(&self, session: u32, datastore: DatastoreId) -> Result<(), DatastoreError> {
        let mut locks = guard(&self.locks);
        match locks.get(&datastore) {
            Some(record) if record.owner == session => return Ok(()),
            Some(record) => {
                return Err(DatastoreError::LockDenied {
                    datastore,
                    holder: record.owner,
                });
            }
            None => {}
        }

        if datastore == DatastoreId::Candidate {
            let running = guard(&self.running);
            let candidate = guard(&self.candidate);
            if candidate.tree.to_xml() != running.tree.to_xml() {
                return Err(DatastoreError::CandidateDirty);
            }
        }

        locks.insert(
            datastore,
            LockRecord {
                owner: session,
                acquired: SystemTime::now(),
            },
        );
        info!("session {session} locked {datastore}");
        Ok(())
    }

    pub fn unlock(&self, session: u32, datastore: DatastoreId) -> Result<(), DatastoreError> {
        let mut locks = guard(&self.locks);
        if !locks.get(&datastore).is_some_and(|r| r.owner == session) {
            return Err(DatastoreError::NotLockHolder(datastore));
        }
        locks.remove(&datastore);
        info!("session {session} unlocked {datastore}");
        Ok(())
    }

    /// Drop every lock `session` holds. Uncommitted candidate changes made
    /// under a candidate lock are discarded.
    pub fn release_session(&self, session: u32) -> Vec<DatastoreId> {
        let mut locks = guard(&self.locks);
        let released: Vec<DatastoreId> = locks
            .iter()
            .filter(|(_, r)| r.owner == session)
            .map(|(ds, _)| *ds)
            .collect();
        for ds in &released {
            locks.remove(ds);
            info!("released {ds} lock of session {session}");
        }

        if released.contains(&DatastoreId::Candidate) {
            let running = guard(&self.running);
            let mut candidate = guard(&self.candidate);
            if candidate.tree != running.tree {
                debug!("discarding candidate changes of session {session}");
                candidate.tree = running.tree.clone();
            }
        }
        released
    }

    /// Take the lock table and check that no other session holds any of
    /// `targets`. The guard must be kept until the write is done.
    fn authorize(&self, session: u32, targets: &[DatastoreId]) -> Result<LockTable<'_>, DatastoreError> {
        let locks = guard(&self.locks);
        for datastore in targets {
            if let Some(record) = locks.get(datastore).filter(|r| r.owner != session) {
                return Err(DatastoreError::LockDenied {
                    datastore: *datastore,
                    holder: record.owner,
                });
            }
        }
        Ok(locks)
    }

    fn store(&self, datastore: DatastoreId) -> &Mutex<Datastore> {
        match datastore {
            DatastoreId::Running => &self.running,
            DatastoreId::Candidate => &self.candidate,
            DatastoreId::Startup => &self.startup,
        }
    }

    fn select(&self, mut tree: Node, filter: Option<&Filter>) -> Result<Node, DatastoreError> {
        tree.name = "data".to_string();
        tree.namespace = None;
        match filter {
            Some(filter) => Ok(self.schema.filter(&tree, filter)?),
            None => Ok(tree),
        }
    }

    /// Contents of one datastore, as a `<data>` element.
    pub fn get_config(
        &self,
        datastore: DatastoreId,
        filter: Option<&Filter>,
    ) -> Result<Node, DatastoreError> {
        let tree = guard(self.store(datastore)).tree.clone();
        self.select(tree, filter)
    }

    /// Running configuration merged with operational state.
    pub fn get(&self, filter: Option<&Filter>) -> Result<Node, DatastoreError> {
        let running = guard(&self.running);
        let mut tree = running.tree.clone();
        let vrfs = delta::SystemConfig::from_tree(&running.tree).vrfs;
        drop(running);

        let kernel = guard(&self.kernel);
        let mut objects = Vec::new();
        for kind in ObjectKind::ALL {
            objects.extend(kernel.enumerate(kind)?);
        }
        let mut tables = vec![("default".to_string(), 0, kernel.vrf_list_routes(0)?)];
        for (name, table) in vrfs {
            match kernel.vrf_list_routes(table) {
                Ok(routes) => tables.push((name, table, routes)),
                Err(e) => warn!("skipping routes of vrf {name}: {e}"),
            }
        }
        drop(kernel);

        tree.push(delta::interfaces_state(&objects));
        tree.push(delta::routing_state(&tables));
        tree.push(self.schema.yang_library());
        self.select(tree, filter)
    }

    pub fn edit_config(
        &self,
        session: u32,
        target: DatastoreId,
        config: &Node,
        default_operation: DefaultOperation,
        error_option: ErrorOption,
    ) -> Result<(), DatastoreError> {
        let edit = Edit::new(self.schema.as_ref())
            .default_operation(default_operation)
            .error_option(error_option);

        match target {
            DatastoreId::Startup => Err(DatastoreError::NotSupported(
                "startup can only be written with copy-config".to_string(),
            )),
            DatastoreId::Running if !self.writable_running => Err(DatastoreError::NotSupported(
                "running is not writable".to_string(),
            )),
            DatastoreId::Running => {
                let locks = self.authorize(session, &[target])?;
                let mut running = guard(&self.running);
                let mut candidate = guard(&self.candidate);
                let mut scratch = running.tree.clone();
                let result = edit.apply(&mut scratch, config);
                if scratch != running.tree {
                    let follows = follows_running(&locks, session, &running, &candidate);
                    self.commit_tree(&mut running, scratch)?;
                    if follows {
                        candidate.tree = running.tree.clone();
                    }
                }
                Ok(result?)
            }
            DatastoreId::Candidate => {
                let _locks = self.authorize(session, &[target])?;
                let mut candidate = guard(&self.candidate);
                Ok(edit.apply(&mut candidate.tree, config)?)
            }
        }
    }

    fn resolve(&self, source: &ConfigSource) -> Result<Node, DatastoreError> {
        match source {
            ConfigSource::Datastore(id) => Ok(guard(self.store(*id)).tree.clone()),
            ConfigSource::Inline(config) => {
                let mut tree = config.clone();
                tree.name = ROOT.to_string();
                tree.namespace = None;
                tree.attributes.clear();
                self.schema.normalize(&mut tree);
                Ok(tree)
            }
        }
    }

    pub fn copy_config(
        &self,
        session: u32,
        target: DatastoreId,
        source: &ConfigSource,
    ) -> Result<(), DatastoreError> {
        if *source == ConfigSource::Datastore(target) {
            return Err(DatastoreError::InvalidValue(format!(
                "cannot copy {target} onto itself"
            )));
        }
        if target == DatastoreId::Running && !self.writable_running {
            return Err(DatastoreError::NotSupported(
                "running is not writable".to_string(),
            ));
        }
        let locks = self.authorize(session, &[target])?;

        let tree = self.resolve(source)?;
        self.schema.validate(&tree).map_err(DatastoreError::Validation)?;

        match target {
            DatastoreId::Running => {
                let mut running = guard(&self.running);
                let mut candidate = guard(&self.candidate);
                let follows = follows_running(&locks, session, &running, &candidate);
                self.commit_tree(&mut running, tree)?;
                if follows {
                    candidate.tree = running.tree.clone();
                }
                Ok(())
            }
            DatastoreId::Candidate => {
                guard(&self.candidate).tree = tree;
                Ok(())
            }
            DatastoreId::Startup => {
                let mut startup = guard(&self.startup);
                if let Some(path) = &self.startup_path {
                    startup::persist(path, &tree)?;
                }
                startup.tree = tree;
                Ok(())
            }
        }
    }

    pub fn delete_config(&self, session: u32, target: DatastoreId) -> Result<(), DatastoreError> {
        if target == DatastoreId::Running {
            return Err(DatastoreError::NotSupported(
                "running cannot be deleted".to_string(),
            ));
        }
        let _locks = self.authorize(session, &[target])?;

        let mut store = guard(self.store(target));
        if target == DatastoreId::Startup {
            if let Some(path) = &self.startup_path {
                startup::persist(path, &Node::new(ROOT))?;
            }
        }
        store.tree = Node::new(ROOT);
        info!("session {session} cleared {target}");
        Ok(())
    }

    pub fn validate(&self, source: &ConfigSource) -> Result<(), DatastoreError> {
        let tree = self.resolve(source)?;
        self.schema.validate(&tree).map_err(DatastoreError::Validation)?;
        self.schema
            .validate_semantics(&tree)
            .map_err(DatastoreError::Validation)
    }

    pub fn commit(&self, session: u32) -> Result<(), DatastoreError> {
        let _locks = self.authorize(session, &[DatastoreId::Candidate, DatastoreId::Running])?;

        let mut running = guard(&self.running);
        let candidate = guard(&self.candidate);
        let target = candidate.tree.clone();
        self.commit_tree(&mut running, target)?;
        info!("session {session} committed candidate");
        Ok(())
    }

    pub fn discard_changes(&self, session: u32) -> Result<(), DatastoreError> {
        let _locks = self.authorize(session, &[DatastoreId::Candidate])?;

        let mut running = guard(&self.running);
        let mut candidate = guard(&self.candidate);
        candidate.tree = running.tree.clone();
        if running.consistency == Consistency::Inconsistent {
            running.consistency = Consistency::Discarded;
        }
        debug!("session {session} discarded candidate changes");
        Ok(())
    }

    /// Validate `target`, push the difference to the kernel and make it the
    /// running configuration. Startup follows a successful commit.
    fn commit_tree(&self, running: &mut Datastore, target: Node) -> Result<(), DatastoreError> {
        if running.consistency == Consistency::Inconsistent {
            return Err(DatastoreError::Inconsistent);
        }
        self.schema
            .validate(&target)
            .and_then(|_| self.schema.validate_semantics(&target))
            .map_err(DatastoreError::CommitValidation)?;

        let delta = Delta::between(&running.tree, &target);
        self.apply_delta(running, &delta)?;

        running.tree = target;
        running.consistency = Consistency::Consistent;

        let mut startup = guard(&self.startup);
        startup.tree = running.tree.clone();
        if let Some(path) = &self.startup_path {
            // Running is already applied; a stale file is only logged.
            if let Err(e) = startup::persist(path, &startup.tree) {
                warn!("committed, but startup not saved to {}: {e}", path.display());
            }
        }
        Ok(())
    }

    fn apply_delta(&self, running: &mut Datastore, delta: &Delta) -> Result<(), DatastoreError> {
        let mut kernel = guard(&self.kernel);
        match delta.apply(&mut **kernel) {
            Ok(()) => Ok(()),
            Err(ApplyError::Rejected(error)) => Err(DatastoreError::Kernel(error)),
            Err(ApplyError::RevertFailed { error, revert }) => {
                warn!("kernel revert failed, running is now inconsistent: {revert}");
                running.consistency = Consistency::Inconsistent;
                Err(DatastoreError::RollbackFailed { error, revert })
            }
        }
    }
}

/// Whether candidate should be rewritten along with running: it holds no
/// staged changes and no other session has it locked.
fn follows_running(locks: &LockTable<'_>, session: u32, running: &Datastore, candidate: &Datastore) -> bool {
    let foreign = locks
        .get(&DatastoreId::Candidate)
        .is_some_and(|r| r.owner != session);
    !foreign && candidate.tree == running.tree
}
