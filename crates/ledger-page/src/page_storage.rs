//! The page storage engine.
//!
//! [`PageStorage`] ties the object layer, the content B-tree and the commit
//! graph of one page together. Every change to the commit set goes through
//! a single ingestion path guarded by an async mutex, so concurrent local
//! commits, cloud sync and peer sync never interleave their head-set
//! updates. Reads are not serialized.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tracing::{debug, info, warn};

use ledger_btree::{
    apply_changes, for_each_diff, for_each_entry, for_each_node, for_each_three_way_diff,
    get_entry, read_node, write_node, TreeNode, TreeStorage,
};
use ledger_crypto::{compute_object_digest, EncryptionService};
use ledger_dag::{
    find_common_ancestors, find_unique_common_ancestor, wall_clock_nanos, Commit,
    CommitComparison, CommitGraph, HeadSet,
};
use ledger_store::{
    split_data, Db, FileIndex, Object, ObjectReferences, ObjectStatus, PageDb, PageDbBatch, Piece,
    StorageError, StorageResult,
};
use ledger_types::{
    ChangeSource, CommitId, Entry, EntryChange, IsObjectSynced, KeyPriority, Location,
    ObjectDigest, ObjectIdentifier, ObjectIdentifierFactory, ObjectType, PageId, PieceType,
    ThreeWayChange,
};

use crate::config::{PageStorageConfig, PruningPolicy};
use crate::delegate::{PageSyncDelegate, RetrievedObjectType};
use crate::journal::{Journal, JournalChange};
use crate::watcher::CommitWatcher;

/// Result of an ingestion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddCommitsOutcome {
    /// Commits newly stored, in the order they were received.
    pub added: Vec<CommitId>,
    /// Parents that are neither stored nor part of the batch. Commits
    /// waiting on them are held back until they arrive.
    pub missing: Vec<CommitId>,
}

#[derive(Clone)]
struct Orphan {
    commit: Commit,
    source: ChangeSource,
    attempts: u32,
}

/// State owned by the ingestion path.
#[derive(Default)]
struct IngestionState {
    orphans: VecDeque<Orphan>,
}

/// A fetched piece waiting to be persisted.
struct FetchedPiece {
    piece: Piece,
    status: ObjectStatus,
}

/// Storage of one page.
pub struct PageStorage {
    page_id: PageId,
    config: PageStorageConfig,
    db: PageDb,
    encryption: Arc<dyn EncryptionService>,
    factory: ObjectIdentifierFactory,
    heads: RwLock<HeadSet>,
    empty_node: OnceCell<ObjectIdentifier>,
    ingestion: AsyncMutex<IngestionState>,
    pub(crate) pruning: AsyncMutex<()>,
    watchers: Mutex<Vec<Weak<dyn CommitWatcher>>>,
    sync_delegate: Mutex<Option<Weak<dyn PageSyncDelegate>>>,
    weak_self: Weak<PageStorage>,
}

impl PageStorage {
    /// Open the page stored in `db`, seeding it with the first commit if it
    /// is new.
    pub async fn open(
        page_id: impl Into<PageId>,
        db: Arc<dyn Db>,
        encryption: Arc<dyn EncryptionService>,
        config: PageStorageConfig,
    ) -> StorageResult<Arc<Self>> {
        let storage = Arc::new_cyclic(|weak_self| Self {
            page_id: page_id.into(),
            config,
            db: PageDb::new(db),
            encryption,
            factory: ObjectIdentifierFactory::new(),
            heads: RwLock::new(HeadSet::new()),
            empty_node: OnceCell::new(),
            ingestion: AsyncMutex::new(IngestionState::default()),
            pruning: AsyncMutex::new(()),
            watchers: Mutex::new(Vec::new()),
            sync_delegate: Mutex::new(None),
            weak_self: weak_self.clone(),
        });
        storage.init().await?;
        Ok(storage)
    }

    async fn init(&self) -> StorageResult<()> {
        self.get_empty_node_identifier().await?;
        let mut heads = self.db.get_heads().await?;
        if heads.is_empty() {
            let mut batch = self.db.start_batch();
            batch.add_head(&CommitId::FIRST, 0);
            self.db.execute(batch).await?;
            heads.push((CommitId::FIRST, 0));
            debug!(page = %self.page_id, "seeded page with the first commit");
        }
        *self.heads.write().expect("lock poisoned") = HeadSet::from_heads(heads);
        Ok(())
    }

    pub fn page_id(&self) -> &PageId {
        &self.page_id
    }

    pub fn config(&self) -> &PageStorageConfig {
        &self.config
    }

    pub fn encryption_service(&self) -> &Arc<dyn EncryptionService> {
        &self.encryption
    }

    /// Identifier of the empty tree, computed once per instance.
    pub async fn get_empty_node_identifier(&self) -> StorageResult<ObjectIdentifier> {
        self.empty_node
            .get_or_try_init(|| async { write_node(self, &TreeNode::empty()).await })
            .await
            .cloned()
    }

    // -----------------------------------------------------------------
    // Watchers and sync delegate
    // -----------------------------------------------------------------

    pub fn add_commit_watcher(&self, watcher: &Arc<dyn CommitWatcher>) {
        self.watchers
            .lock()
            .expect("lock poisoned")
            .push(Arc::downgrade(watcher));
    }

    pub fn remove_commit_watcher(&self, watcher: &Arc<dyn CommitWatcher>) {
        let target = Arc::downgrade(watcher);
        self.watchers
            .lock()
            .expect("lock poisoned")
            .retain(|w| !Weak::ptr_eq(w, &target) && w.strong_count() > 0);
    }

    /// Register the source of pieces missing locally. Only a weak handle is
    /// kept.
    pub fn set_sync_delegate(&self, delegate: &Arc<dyn PageSyncDelegate>) {
        *self.sync_delegate.lock().expect("lock poisoned") = Some(Arc::downgrade(delegate));
    }

    pub fn clear_sync_delegate(&self) {
        *self.sync_delegate.lock().expect("lock poisoned") = None;
    }

    fn sync_delegate(&self) -> Option<Arc<dyn PageSyncDelegate>> {
        self.sync_delegate
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn notify_watchers(&self, commits: &[Commit], source: ChangeSource) {
        let watchers: Vec<Arc<dyn CommitWatcher>> = {
            let mut watchers = self.watchers.lock().expect("lock poisoned");
            watchers.retain(|w| w.strong_count() > 0);
            watchers.iter().filter_map(Weak::upgrade).collect()
        };
        for watcher in watchers {
            watcher.on_new_commits(commits, source);
        }
    }

    // -----------------------------------------------------------------
    // Commits
    // -----------------------------------------------------------------

    /// Current heads, oldest first. Never empty.
    pub async fn get_head_commits(&self) -> StorageResult<Vec<Commit>> {
        let ids = self.heads.read().expect("lock poisoned").ids();
        let mut commits = Vec::with_capacity(ids.len());
        for id in ids {
            commits.push(self.get_commit(&id).await?);
        }
        Ok(commits)
    }

    pub fn head_count(&self) -> usize {
        self.heads.read().expect("lock poisoned").len()
    }

    /// Fails with [`StorageError::NotFound`] for unknown ids. The first
    /// commit is synthesized.
    pub async fn get_commit(&self, id: &CommitId) -> StorageResult<Commit> {
        if id.is_first() {
            return Commit::first(self.get_empty_node_identifier().await?);
        }
        let bytes = self.db.get_commit_storage_bytes(id).await?;
        Commit::from_storage_bytes(&self.factory, *id, bytes)
    }

    async fn has_commit(&self, id: &CommitId) -> StorageResult<bool> {
        if id.is_first() {
            return Ok(true);
        }
        self.db.has_commit(id).await
    }

    /// Merge commits of exactly these two parents, in either order.
    pub async fn get_merge_commit_ids(
        &self,
        parent1: &CommitId,
        parent2: &CommitId,
    ) -> StorageResult<Vec<CommitId>> {
        let (low, high) = if parent1 <= parent2 {
            (parent1, parent2)
        } else {
            (parent2, parent1)
        };
        self.db.get_merges(low, high).await
    }

    /// True iff the page has a single head whose tree is empty.
    pub async fn is_empty(&self) -> StorageResult<bool> {
        let heads = self.get_head_commits().await?;
        let empty = self.get_empty_node_identifier().await?;
        Ok(heads.len() == 1 && heads[0].root_identifier() == &empty)
    }

    // -----------------------------------------------------------------
    // Journals
    // -----------------------------------------------------------------

    pub async fn start_commit(&self, parent: &CommitId) -> StorageResult<Journal> {
        Ok(Journal::simple(self.get_commit(parent).await?))
    }

    /// Start a merge journal, pre-filled with the automatic merge of both
    /// parents.
    pub async fn start_merge_commit(
        &self,
        left: &CommitId,
        right: &CommitId,
    ) -> StorageResult<Journal> {
        if left == right {
            return Err(StorageError::InvalidArgument(format!(
                "cannot merge commit {} with itself",
                left.short_hex()
            )));
        }
        let left = self.get_commit(left).await?;
        let right = self.get_commit(right).await?;
        let merged_root = self.auto_merge(&left, &right).await?;
        Ok(Journal::merge(left, right, merged_root))
    }

    /// Contents of `left` with the non-conflicting changes of `right`;
    /// conflicting keys take the value of the newer commit.
    async fn auto_merge(&self, left: &Commit, right: &Commit) -> StorageResult<ObjectIdentifier> {
        let base = match find_common_ancestors(self, left, right).await? {
            CommitComparison::Equivalent | CommitComparison::RightSubsetOfLeft => {
                return Ok(left.root_identifier().clone())
            }
            CommitComparison::LeftSubsetOfRight => return Ok(right.root_identifier().clone()),
            CommitComparison::Diverged(mut ancestors) if ancestors.len() == 1 => {
                ancestors.remove(0)
            }
            CommitComparison::Diverged(_) => {
                find_unique_common_ancestor(self, vec![left.clone(), right.clone()]).await?
            }
        };
        let right_wins = right.order_key() > left.order_key();
        let mut changes = Vec::new();
        for_each_three_way_diff(
            self,
            base.root_identifier(),
            left.root_identifier(),
            right.root_identifier(),
            Location::Network,
            "",
            |change| {
                changes.extend(take_right(change, right_wins));
                true
            },
        )
        .await?;
        apply_changes(self, left.root_identifier(), changes).await
    }

    /// Turn the journal into a commit and add it.
    ///
    /// Returns `None` for a journal without edits.
    pub async fn commit_journal(&self, journal: Journal) -> StorageResult<Option<Commit>> {
        if journal.is_noop() {
            return Ok(None);
        }
        let base_root = if journal.is_cleared() {
            self.get_empty_node_identifier().await?
        } else {
            journal.base_root().clone()
        };
        let changes = self.journal_changes(&journal, &base_root).await?;
        let root = apply_changes(self, &base_root, changes).await?;
        let parents: Vec<&Commit> = journal.parents().iter().collect();
        let commit = Commit::from_parents(root, &parents, wall_clock_nanos())?;
        debug!(
            page = %self.page_id,
            commit = %commit.id().short_hex(),
            merge = commit.is_merge(),
            "committing journal"
        );
        self.add_commits(vec![commit.clone()], ChangeSource::Local)
            .await?;
        Ok(Some(commit))
    }

    async fn journal_changes(
        &self,
        journal: &Journal,
        base_root: &ObjectIdentifier,
    ) -> StorageResult<Vec<EntryChange>> {
        let mut changes = Vec::with_capacity(journal.changes().len());
        for (key, change) in journal.changes() {
            let entry_id = match journal.parents() {
                [left, right] => self.encryption.get_entry_id_for_merge(
                    key,
                    left.id(),
                    right.id(),
                    change.operation(),
                ),
                _ => self.encryption.get_entry_id(),
            };
            match change {
                JournalChange::Put {
                    identifier,
                    priority,
                } => {
                    if identifier.factory_id() != self.factory.id() {
                        return Err(StorageError::InvalidArgument(format!(
                            "identifier for key {key} belongs to another page"
                        )));
                    }
                    changes.push(EntryChange::put(Entry::new(
                        key.clone(),
                        identifier.clone(),
                        *priority,
                        entry_id,
                    )));
                }
                JournalChange::Delete => {
                    match get_entry(self, base_root, Location::Network, key).await {
                        Ok(entry) => changes.push(EntryChange::delete(entry)),
                        Err(StorageError::KeyNotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(changes)
    }

    // -----------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------

    /// Add commits received from sync.
    ///
    /// Commits already present are skipped (and marked synced when they
    /// come from the cloud). Commits whose parents are unknown are reported
    /// through [`AddCommitsOutcome::missing`] and held back.
    pub async fn add_commits_from_sync(
        &self,
        entries: Vec<(CommitId, Bytes)>,
        source: ChangeSource,
    ) -> StorageResult<AddCommitsOutcome> {
        let mut commits = Vec::with_capacity(entries.len());
        for (id, bytes) in entries {
            commits.push(Commit::from_storage_bytes(&self.factory, id, bytes)?);
        }

        if self.sync_delegate().is_some() {
            let parents: HashSet<CommitId> = commits
                .iter()
                .flat_map(|c| c.parent_ids().iter().copied())
                .collect();
            for commit in &commits {
                if parents.contains(commit.id()) || self.has_commit(commit.id()).await? {
                    continue;
                }
                self.fetch_remote_tree(commit.root_identifier()).await?;
            }
        }

        self.add_commits(commits, source).await
    }

    /// Make every node of a remote tree and its eager values local.
    async fn fetch_remote_tree(&self, root: &ObjectIdentifier) -> StorageResult<()> {
        let mut eager = Vec::new();
        for_each_node(self, root, Location::Network, |_, node| {
            eager.extend(
                node.entries()
                    .iter()
                    .filter(|e| e.priority == KeyPriority::Eager)
                    .map(|e| e.object_identifier.clone()),
            );
        })
        .await?;
        for value in eager {
            if value.digest().is_inlined() || self.db.has_piece(value.digest()).await? {
                continue;
            }
            self.get_object(&value, Location::Network).await?;
        }
        Ok(())
    }

    /// The single ingestion path for local and synced commits.
    async fn add_commits(
        &self,
        commits: Vec<Commit>,
        source: ChangeSource,
    ) -> StorageResult<AddCommitsOutcome> {
        let mut state = self.ingestion.lock().await;

        // Held orphans are retried first, in the order they arrived.
        let retried = state.orphans.len();
        let mut candidates: Vec<Orphan> = state.orphans.iter().cloned().collect();
        candidates.extend(commits.into_iter().map(|commit| Orphan {
            commit,
            source,
            attempts: 0,
        }));

        let order = parents_first(&candidates);

        let mut heads = self.heads.read().expect("lock poisoned").clone();
        let mut batch = self.db.start_batch();
        let mut seen = HashSet::new();
        let mut accepted: HashMap<CommitId, u64> = HashMap::new();
        let mut missing = BTreeSet::new();
        let mut orphaned = Vec::new();
        for i in order {
            let Orphan { commit, source, .. } = &candidates[i];
            let id = *commit.id();
            if !seen.insert(id) {
                continue;
            }
            if self.has_commit(&id).await? {
                if *source == ChangeSource::Cloud && !self.db.is_commit_synced(&id).await? {
                    batch.mark_commit_synced(&id);
                }
                continue;
            }

            let mut absent = Vec::new();
            for parent in commit.parent_ids() {
                if !accepted.contains_key(parent) && !self.has_commit(parent).await? {
                    absent.push(*parent);
                }
            }
            if !absent.is_empty() {
                warn!(
                    page = %self.page_id,
                    commit = %id.short_hex(),
                    missing = absent.len(),
                    "commit has unknown parents"
                );
                missing.extend(absent);
                orphaned.push(i);
                continue;
            }

            let mut expected = 0;
            for parent in commit.parent_ids() {
                let generation = match accepted.get(parent) {
                    Some(generation) => *generation,
                    None => self.get_commit(parent).await?.generation(),
                };
                expected = expected.max(generation + 1);
            }
            if commit.generation() != expected {
                warn!(
                    page = %self.page_id,
                    commit = %id.short_hex(),
                    generation = commit.generation(),
                    expected,
                    "rejecting commit with inconsistent generation"
                );
                if i < retried {
                    // A held orphan must not poison later batches.
                    continue;
                }
                return Err(StorageError::DataIntegrity(format!(
                    "commit {} claims generation {} but its parents imply {}",
                    id.short_hex(),
                    commit.generation(),
                    expected
                )));
            }

            batch.add_commit_storage_bytes(
                &id,
                commit.root_identifier().digest(),
                commit.storage_bytes(),
            );
            if let [parent1, parent2] = commit.parent_ids() {
                batch.add_merge(parent1, parent2, &id);
            }
            if *source != ChangeSource::Cloud {
                batch.mark_commit_unsynced(&id, commit.generation());
                self.mark_all_pieces_local(commit.root_identifier(), &mut batch)
                    .await?;
            }
            for parent in commit.parent_ids() {
                if heads.remove(parent) {
                    batch.remove_head(parent);
                }
            }
            heads.insert(id, commit.timestamp());
            batch.add_head(&id, commit.timestamp());
            accepted.insert(id, commit.generation());
        }

        let mut backlog: VecDeque<Orphan> = VecDeque::new();
        for i in orphaned {
            let mut orphan = candidates[i].clone();
            if i < retried {
                orphan.attempts += 1;
            }
            if orphan.attempts >= self.config.max_orphan_attempts {
                warn!(
                    page = %self.page_id,
                    commit = %orphan.commit.id().short_hex(),
                    attempts = orphan.attempts,
                    "dropping orphan commit"
                );
                continue;
            }
            backlog.push_back(orphan);
        }
        while backlog.len() > self.config.max_orphans {
            if let Some(dropped) = backlog.pop_front() {
                warn!(
                    page = %self.page_id,
                    commit = %dropped.commit.id().short_hex(),
                    "orphan backlog full, dropping oldest"
                );
            }
        }

        if !batch.is_empty() {
            self.db.execute(batch).await?;
        }
        *self.heads.write().expect("lock poisoned") = heads;
        state.orphans = backlog;

        // Notify in arrival order, one call per consecutive run of sources.
        let mut notified = HashSet::new();
        let mut runs: Vec<(ChangeSource, Vec<Commit>)> = Vec::new();
        for candidate in &candidates {
            let id = *candidate.commit.id();
            if !accepted.contains_key(&id) || !notified.insert(id) {
                continue;
            }
            match runs.last_mut() {
                Some((run_source, run)) if *run_source == candidate.source => {
                    run.push(candidate.commit.clone())
                }
                _ => runs.push((candidate.source, vec![candidate.commit.clone()])),
            }
        }
        let added: Vec<CommitId> = runs
            .iter()
            .flat_map(|(_, run)| run.iter().map(|c| *c.id()))
            .collect();
        if !added.is_empty() {
            info!(
                page = %self.page_id,
                ?source,
                added = added.len(),
                heads = self.head_count(),
                "added commits"
            );
            for (run_source, run) in &runs {
                self.notify_watchers(run, *run_source);
            }
        }
        drop(state);

        if !added.is_empty() {
            self.schedule_pruning();
        }
        Ok(AddCommitsOutcome {
            added,
            missing: missing.into_iter().collect(),
        })
    }

    /// Upgrade every transient piece reachable from `root` to local, inside
    /// the batch that adds the commit.
    async fn mark_all_pieces_local(
        &self,
        root: &ObjectIdentifier,
        batch: &mut PageDbBatch,
    ) -> StorageResult<()> {
        let mut nodes = vec![root.clone()];
        let mut seen = HashSet::new();
        while let Some(node_id) = nodes.pop() {
            if !seen.insert(node_id.digest().clone()) {
                continue;
            }
            if !node_id.digest().is_inlined() {
                // A node already reachable from a commit has a reachable
                // subtree too.
                if self.db.get_object_status(node_id.digest()).await?
                    != Some(ObjectStatus::Transient)
                {
                    continue;
                }
            }
            self.mark_object_local(node_id.digest(), batch).await?;
            let node = read_node(self, &node_id, Location::Local).await?;
            for entry in node.entries() {
                self.mark_object_local(entry.object_identifier.digest(), batch)
                    .await?;
            }
            nodes.extend(node.children().iter().flatten().cloned());
        }
        Ok(())
    }

    /// Upgrade one object's transient pieces, following index pieces.
    async fn mark_object_local(
        &self,
        digest: &ObjectDigest,
        batch: &mut PageDbBatch,
    ) -> StorageResult<()> {
        let mut pending = vec![digest.clone()];
        while let Some(digest) = pending.pop() {
            if digest.is_inlined()
                || self.db.get_object_status(&digest).await? != Some(ObjectStatus::Transient)
            {
                continue;
            }
            batch.set_object_status(&digest, ObjectStatus::Local);
            if digest.info().piece_type == PieceType::Index {
                let data = self.db.read_piece(&digest).await?.ok_or_else(|| {
                    StorageError::Internal(format!("piece {} lost its content", digest.short_hex()))
                })?;
                for child in FileIndex::decode(&data)?.children {
                    pending.push(ObjectDigest::from_bytes(child.digest)?);
                }
            }
        }
        Ok(())
    }

    fn schedule_pruning(&self) {
        if self.config.pruning_policy != PruningPolicy::LocalImmediate {
            return;
        }
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            let Some(storage) = weak.upgrade() else {
                return;
            };
            if let Err(e) = crate::pruner::prune(&storage).await {
                warn!(page = %storage.page_id, error = %e, "pruning failed");
            }
        });
    }

    /// Remove commits from storage and collect the objects only they held.
    ///
    /// Heads cannot be deleted.
    pub async fn delete_commits(&self, commits: Vec<Commit>) -> StorageResult<()> {
        let _state = self.ingestion.lock().await;
        let head = {
            let heads = self.heads.read().expect("lock poisoned");
            commits.iter().find(|c| heads.contains(c.id())).map(|c| *c.id())
        };
        if let Some(head) = head {
            return Err(StorageError::InvalidArgument(format!(
                "cannot delete head commit {}",
                head.short_hex()
            )));
        }

        let mut batch = self.db.start_batch();
        let mut roots = Vec::new();
        for commit in &commits {
            if commit.id().is_first() {
                continue;
            }
            batch.delete_commit(commit.id(), commit.root_identifier().digest());
            if let [parent1, parent2] = commit.parent_ids() {
                batch.delete_merge(parent1, parent2, commit.id());
            }
            roots.push(commit.root_identifier().digest().clone());
        }
        let count = roots.len();
        // Dropping the commits releases their root identifiers.
        drop(commits);
        if !batch.is_empty() {
            self.db.execute(batch).await?;
        }
        let collected = self.collect_garbage(roots).await?;
        debug!(page = %self.page_id, commits = count, objects = collected, "deleted commits");
        Ok(())
    }

    /// Delete unreferenced pieces, starting from `candidates` and cascading
    /// to the pieces they referenced.
    async fn collect_garbage(&self, mut candidates: Vec<ObjectDigest>) -> StorageResult<usize> {
        let mut collected = 0;
        while let Some(digest) = candidates.pop() {
            if digest.is_inlined() || self.factory.is_live(&digest) {
                continue;
            }
            match self.db.get_object_status(&digest).await? {
                None | Some(ObjectStatus::Transient) => continue,
                Some(_) => {}
            }
            if self.db.has_inbound_references(&digest).await? {
                continue;
            }
            let references = self.db.get_references(&digest).await?;
            let mut batch = self.db.start_batch();
            batch.delete_piece(&digest, &references);
            self.db.execute(batch).await?;
            collected += 1;
            candidates.extend(references.into_keys());
        }
        Ok(collected)
    }

    // -----------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------

    /// Split `data` into pieces and store them as transient.
    ///
    /// `tree_references` are the objects the value refers to at tree level;
    /// they are attached to the root piece.
    pub async fn add_object_from_local(
        &self,
        object_type: ObjectType,
        data: Bytes,
        tree_references: ObjectReferences,
    ) -> StorageResult<ObjectIdentifier> {
        let permutation = self.encryption.get_chunking_permutation().await?;
        let split = split_data(&data, object_type, &permutation, |digest| {
            self.encryption.make_object_identifier(&self.factory, digest)
        })?;
        let mut batch = self.db.start_batch();
        for piece in &split.pieces {
            let digest = piece.identifier().digest();
            if self.db.get_object_status(digest).await?.is_some() {
                continue;
            }
            let mut references = piece.piece_references()?;
            if piece.identifier() == &split.root {
                references.extend(tree_references.iter().map(|(d, p)| (d.clone(), *p)));
            }
            batch.write_piece(digest, piece.data(), ObjectStatus::Transient, &references)?;
        }
        if !batch.is_empty() {
            self.db.execute(batch).await?;
        }
        Ok(split.root)
    }

    /// A piece available without I/O beyond local storage.
    pub async fn get_piece(&self, identifier: &ObjectIdentifier) -> StorageResult<Piece> {
        if let Some(piece) = Piece::from_inlined(identifier) {
            return Ok(piece);
        }
        match self.db.read_piece(identifier.digest()).await? {
            Some(data) => Ok(Piece::new(identifier.clone(), Bytes::from(data))),
            None => Err(StorageError::NotFound(format!(
                "piece {}",
                identifier.digest().short_hex()
            ))),
        }
    }

    pub async fn get_object(
        &self,
        identifier: &ObjectIdentifier,
        location: Location,
    ) -> StorageResult<Object> {
        let data = self.get_object_part(identifier, 0, -1, location).await?;
        Ok(Object::new(identifier.clone(), data))
    }

    /// Read part of an object.
    ///
    /// A negative `offset` counts from the end; a negative `max_size` reads
    /// to the end. Offsets outside the object yield no data. Only the
    /// pieces overlapping the range are read.
    pub async fn get_object_part(
        &self,
        identifier: &ObjectIdentifier,
        offset: i64,
        max_size: i64,
        location: Location,
    ) -> StorageResult<Bytes> {
        let mut fetched = Vec::new();
        let root = self.load_piece(identifier, location, &mut fetched).await?;
        let size = if root.is_index() {
            FileIndex::decode(root.data())?.size()
        } else {
            root.data().len() as u64
        };

        let start = if offset < 0 {
            match size.checked_sub(offset.unsigned_abs()) {
                Some(start) => start,
                None => return Ok(Bytes::new()),
            }
        } else {
            offset as u64
        };
        if start >= size {
            self.persist_fetched(identifier, fetched, None).await?;
            return Ok(Bytes::new());
        }
        let end = if max_size < 0 {
            size
        } else {
            size.min(start.saturating_add(max_size as u64))
        };

        let mut out = Vec::with_capacity((end - start) as usize);
        let mut stack = vec![(root, 0u64)];
        while let Some((piece, piece_start)) = stack.pop() {
            if piece.is_index() {
                let index = FileIndex::decode(piece.data())?;
                let mut overlapping = Vec::new();
                let mut child_start = piece_start;
                for child in &index.children {
                    let child_end = child_start + child.size;
                    if child_end > start && child_start < end {
                        overlapping.push((child.identifier(&self.factory)?, child_start));
                    }
                    child_start = child_end;
                }
                for (child, child_start) in overlapping.into_iter().rev() {
                    let piece = self.load_piece(&child, location, &mut fetched).await?;
                    stack.push((piece, child_start));
                }
            } else {
                let data = piece.data();
                let piece_end = piece_start + data.len() as u64;
                let from = start.max(piece_start) - piece_start;
                let to = end.min(piece_end).saturating_sub(piece_start);
                if from < to {
                    out.extend_from_slice(&data[from as usize..to as usize]);
                }
            }
        }

        let tree_references = if start == 0 && end == size && is_tree_node(identifier) {
            Some(TreeNode::decode(&self.factory, &out)?.references())
        } else {
            None
        };
        self.persist_fetched(identifier, fetched, tree_references).await?;
        Ok(Bytes::from(out))
    }

    /// Read a piece locally, or through the sync delegate if `location`
    /// allows it.
    async fn load_piece(
        &self,
        identifier: &ObjectIdentifier,
        location: Location,
        fetched: &mut Vec<FetchedPiece>,
    ) -> StorageResult<Piece> {
        match self.get_piece(identifier).await {
            Ok(piece) => return Ok(piece),
            Err(StorageError::NotFound(_)) if location == Location::Network => {}
            Err(e) => return Err(e),
        }
        let delegate = self.sync_delegate().ok_or_else(|| {
            StorageError::NotFound(format!(
                "piece {} is not local and no sync delegate is set",
                identifier.digest().short_hex()
            ))
        })?;
        let info = identifier.digest().info();
        let retrieved_type = if is_tree_node(identifier) {
            RetrievedObjectType::TreeNode
        } else {
            RetrievedObjectType::Blob
        };
        let remote = delegate.get_object(identifier, retrieved_type).await?;
        if compute_object_digest(info.piece_type, info.object_type, &remote.data)
            != *identifier.digest()
        {
            warn!(
                page = %self.page_id,
                digest = %identifier.digest().short_hex(),
                source = ?remote.source,
                "fetched piece does not match its digest"
            );
            return Err(StorageError::DataIntegrity(format!(
                "piece {} does not match its digest",
                identifier.digest().short_hex()
            )));
        }
        let status = match remote.is_synced {
            IsObjectSynced::Yes => ObjectStatus::Synced,
            IsObjectSynced::No => ObjectStatus::Local,
        };
        let piece = Piece::new(identifier.clone(), remote.data);
        fetched.push(FetchedPiece {
            piece: piece.clone(),
            status,
        });
        Ok(piece)
    }

    /// Persist pieces fetched while reading `root`. The root piece of a tree
    /// node is only stored once its tree references are known.
    async fn persist_fetched(
        &self,
        root: &ObjectIdentifier,
        fetched: Vec<FetchedPiece>,
        tree_references: Option<ObjectReferences>,
    ) -> StorageResult<()> {
        if fetched.is_empty() {
            return Ok(());
        }
        let mut batch = self.db.start_batch();
        for FetchedPiece { piece, status } in fetched {
            let digest = piece.identifier().digest();
            let mut references = piece.piece_references()?;
            if digest == root.digest() {
                match &tree_references {
                    Some(tree) => references.extend(tree.iter().map(|(d, p)| (d.clone(), *p))),
                    None if is_tree_node(root) => continue,
                    None => {}
                }
            }
            batch.write_piece(digest, piece.data(), status, &references)?;
        }
        if !batch.is_empty() {
            self.db.execute(batch).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Contents
    // -----------------------------------------------------------------

    pub async fn get_commit_contents<F>(
        &self,
        commit: &Commit,
        min_key: &str,
        on_next: F,
    ) -> StorageResult<()>
    where
        F: FnMut(Entry) -> bool + Send,
    {
        for_each_entry(self, commit.root_identifier(), Location::Network, min_key, on_next).await
    }

    /// Fails with [`StorageError::KeyNotFound`] if `key` is absent.
    pub async fn get_entry_from_commit(&self, commit: &Commit, key: &str) -> StorageResult<Entry> {
        get_entry(self, commit.root_identifier(), Location::Network, key).await
    }

    pub async fn get_commit_contents_diff<F>(
        &self,
        base: &Commit,
        other: &Commit,
        min_key: &str,
        on_next: F,
    ) -> StorageResult<()>
    where
        F: FnMut(EntryChange) -> bool + Send,
    {
        for_each_diff(
            self,
            base.root_identifier(),
            other.root_identifier(),
            Location::Network,
            min_key,
            on_next,
        )
        .await
    }

    pub async fn get_three_way_contents_diff<F>(
        &self,
        base: &Commit,
        left: &Commit,
        right: &Commit,
        min_key: &str,
        on_next: F,
    ) -> StorageResult<()>
    where
        F: FnMut(ThreeWayChange) -> bool + Send,
    {
        for_each_three_way_diff(
            self,
            base.root_identifier(),
            left.root_identifier(),
            right.root_identifier(),
            Location::Network,
            min_key,
            on_next,
        )
        .await
    }

    // -----------------------------------------------------------------
    // Sync bookkeeping
    // -----------------------------------------------------------------

    /// Commits not yet uploaded, parents before children.
    pub async fn get_unsynced_commits(&self) -> StorageResult<Vec<Commit>> {
        let mut ids = self.db.get_unsynced_commit_ids().await?;
        ids.sort_by_key(|(id, generation)| (*generation, *id));
        let mut commits = Vec::with_capacity(ids.len());
        for (id, _) in ids {
            commits.push(self.get_commit(&id).await?);
        }
        Ok(commits)
    }

    pub async fn is_commit_synced(&self, id: &CommitId) -> StorageResult<bool> {
        self.db.is_commit_synced(id).await
    }

    pub async fn mark_commit_synced(&self, id: &CommitId) -> StorageResult<()> {
        let mut batch = self.db.start_batch();
        batch.mark_commit_synced(id);
        batch.mark_page_online();
        self.db.execute(batch).await
    }

    /// Committed pieces not yet uploaded.
    pub async fn get_unsynced_pieces(&self) -> StorageResult<Vec<ObjectIdentifier>> {
        let digests = self.db.get_unsynced_pieces().await?;
        Ok(digests
            .into_iter()
            .map(|digest| self.encryption.make_object_identifier(&self.factory, digest))
            .collect())
    }

    pub async fn mark_piece_synced(&self, identifier: &ObjectIdentifier) -> StorageResult<()> {
        if identifier.digest().is_inlined() {
            return Ok(());
        }
        if self.db.get_object_status(identifier.digest()).await?.is_none() {
            return Err(StorageError::NotFound(format!(
                "piece {}",
                identifier.digest().short_hex()
            )));
        }
        let mut batch = self.db.start_batch();
        batch.set_object_status(identifier.digest(), ObjectStatus::Synced);
        self.db.execute(batch).await
    }

    /// Inlined pieces count as synced.
    pub async fn is_piece_synced(&self, identifier: &ObjectIdentifier) -> StorageResult<bool> {
        if identifier.digest().is_inlined() {
            return Ok(true);
        }
        match self.db.get_object_status(identifier.digest()).await? {
            Some(status) => Ok(status == ObjectStatus::Synced),
            None => Err(StorageError::NotFound(format!(
                "piece {}",
                identifier.digest().short_hex()
            ))),
        }
    }

    /// No unsynced commit and no unsynced piece.
    pub async fn is_synced(&self) -> StorageResult<bool> {
        Ok(self.db.get_unsynced_commit_ids().await?.is_empty()
            && self.db.get_unsynced_pieces().await?.is_empty())
    }

    /// Whether the page was ever synced to the cloud or a peer.
    pub async fn is_online(&self) -> StorageResult<bool> {
        self.db.is_page_online().await
    }

    pub async fn mark_synced_to_peer(&self) -> StorageResult<()> {
        let mut batch = self.db.start_batch();
        batch.mark_page_online();
        self.db.execute(batch).await
    }

    pub async fn set_sync_metadata(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let mut batch = self.db.start_batch();
        batch.set_sync_metadata(key, value);
        self.db.execute(batch).await
    }

    pub async fn get_sync_metadata(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.db.get_sync_metadata(key).await
    }
}

fn is_tree_node(identifier: &ObjectIdentifier) -> bool {
    identifier.digest().info().object_type == ObjectType::TreeNode
}

fn same_value(a: &Option<Entry>, b: &Option<Entry>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.same_value(b),
        _ => false,
    }
}

/// The change to apply on top of the left tree to merge in the right side,
/// if any.
fn take_right(change: ThreeWayChange, right_wins: bool) -> Option<EntryChange> {
    let left_changed = !same_value(&change.base, &change.left);
    let right_changed = !same_value(&change.base, &change.right);
    if !right_changed || (left_changed && !right_wins) {
        return None;
    }
    match (change.right, change.left) {
        (Some(right), _) => Some(EntryChange::put(right)),
        (None, Some(left)) => Some(EntryChange::delete(left)),
        (None, None) => None,
    }
}

#[async_trait]
impl TreeStorage for PageStorage {
    fn identifier_factory(&self) -> &ObjectIdentifierFactory {
        &self.factory
    }

    async fn get_tree_node_data(
        &self,
        identifier: &ObjectIdentifier,
        location: Location,
    ) -> StorageResult<Bytes> {
        self.get_object_part(identifier, 0, -1, location).await
    }

    async fn add_tree_node(
        &self,
        data: Bytes,
        references: ObjectReferences,
    ) -> StorageResult<ObjectIdentifier> {
        self.add_object_from_local(ObjectType::TreeNode, data, references)
            .await
    }
}

#[async_trait]
impl CommitGraph for PageStorage {
    async fn get_commit(&self, id: &CommitId) -> StorageResult<Commit> {
        PageStorage::get_commit(self, id).await
    }
}

impl std::fmt::Debug for PageStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageStorage")
            .field("page_id", &self.page_id)
            .field("heads", &self.head_count())
            .finish_non_exhaustive()
    }
}

/// Candidate indices ordered so that every in-batch parent comes before its
/// children. Follows parent links rather than the commits' own generations,
/// which are not trusted until checked.
fn parents_first(candidates: &[Orphan]) -> Vec<usize> {
    let index: HashMap<CommitId, usize> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| (*c.commit.id(), i))
        .collect();
    let mut placed = vec![false; candidates.len()];
    let mut visiting = vec![false; candidates.len()];
    let mut order = Vec::with_capacity(candidates.len());
    for start in 0..candidates.len() {
        let mut stack = vec![(start, false)];
        while let Some((i, expanded)) = stack.pop() {
            if placed[i] {
                continue;
            }
            if expanded {
                placed[i] = true;
                order.push(i);
                continue;
            }
            if visiting[i] {
                continue;
            }
            visiting[i] = true;
            stack.push((i, true));
            for parent in candidates[i].commit.parent_ids() {
                if let Some(&p) = index.get(parent) {
                    if !placed[p] {
                        stack.push((p, false));
                    }
                }
            }
        }
    }
    order
}
