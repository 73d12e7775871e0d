//! Operation submission and the dependency cascade.
//!
//! Submitting an operation queues it and then walks its entity's
//! dependencies in two phases around a "move to end" step:
//!
//! | Kind          | Phase 1 (before moving)                   | Phase 2 (after moving)                   |
//! |---------------|-------------------------------------------|------------------------------------------|
//! | Insert/Update | parents: insert, update or re-insert      | children: insert or update; removed children: delete |
//! | Delete        | removed children and children: delete     | parents: flag for refresh                |
//!
//! Operations submitted during phase 1 append themselves to the queue before
//! the current operation moves behind them, so parents run before children
//! for inserts and updates, and children before parents for deletes. An
//! entity that already has a pending operation is not recursed into again,
//! which ends cycles.

use std::sync::Arc;

use datamap_core::{Error, Result};

use crate::entity::ErasedEntity;
use crate::map::{DependencyMode, UberMap, same_map};
use crate::meta::{EntityState, PendingRef};
use crate::operation::{OperationCore, OperationKind, OperationState};
use crate::repository::{RepositoryCore, RepositoryState};

/// Queue `operation` and cascade to its dependencies.
///
/// Must be called with the master lock held (`state` is its guard).
pub(crate) fn submit(
    repository: &RepositoryCore,
    state: &mut RepositoryState,
    operation: &Arc<OperationCore>,
) -> Result<()> {
    if matches!(
        operation.state(),
        OperationState::Submitted | OperationState::Executed
    ) {
        return Err(Error::AlreadySubmitted {
            entity: operation.entity.type_name(),
            operation: operation.kind().name(),
        });
    }
    ensure_attached(repository, state, operation)?;

    let meta = &operation.meta;
    if let Some(previous) = meta.pending() {
        if previous.id != operation.id {
            // An insert that has not run yet means there is no row to touch.
            let unsaved = previous.kind == OperationKind::Insert && meta.record().is_none();
            tracing::debug!(
                serial = meta.serial(),
                previous = %previous.kind,
                next = %operation.kind(),
                unsaved,
                "Superseding pending operation"
            );
            state.discard_operation(previous.id, false);
            if unsaved {
                match operation.kind() {
                    OperationKind::Update => operation.set_kind(OperationKind::Insert),
                    OperationKind::Delete => return cancel_insert(repository, state, operation),
                    OperationKind::Insert => {}
                }
            }
        }
    }

    let kind = operation.kind();
    meta.set_to_refresh(true);
    meta.set_pending(PendingRef {
        id: operation.id,
        kind,
    });
    operation.set_state(OperationState::Submitted);
    state.push_operation(operation.clone());
    tracing::debug!(
        id = operation.id,
        kind = %kind,
        entity = operation.entity.type_name(),
        serial = meta.serial(),
        "Operation submitted"
    );

    match kind {
        OperationKind::Delete => delete_children(repository, state, operation)?,
        OperationKind::Insert | OperationKind::Update => {
            upsert_parents(repository, state, operation)?;
        }
    }

    state.move_to_end(operation.id);

    match kind {
        OperationKind::Delete => refresh_parents(operation),
        OperationKind::Insert | OperationKind::Update => {
            upsert_children(repository, state, operation)?;
        }
    }
    Ok(())
}

/// Delete of an entity whose insert never ran. Nothing reaches the link:
/// children are cascaded as for any delete, then the entity is detached and
/// the operation ends up discarded.
fn cancel_insert(
    repository: &RepositoryCore,
    state: &mut RepositoryState,
    operation: &Arc<OperationCore>,
) -> Result<()> {
    let meta = &operation.meta;
    meta.set_pending(PendingRef {
        id: operation.id,
        kind: OperationKind::Delete,
    });
    let cascaded = delete_children(repository, state, operation);
    meta.clear_pending(operation.id);
    state.detach(meta);
    operation.set_state(OperationState::Discarded);
    tracing::debug!(
        serial = meta.serial(),
        entity = operation.entity.type_name(),
        "Pending insert cancelled"
    );
    cascaded
}

/// Attach the entity for inserts; require attachment to this repository
/// for updates and deletes.
fn ensure_attached(
    repository: &RepositoryCore,
    state: &mut RepositoryState,
    operation: &OperationCore,
) -> Result<()> {
    let entity = operation.entity.type_name();
    if operation.map.repository_id() != repository.id {
        return Err(Error::ForeignRepository { entity });
    }
    match operation.meta.map() {
        Some(current) if same_map(&current, &operation.map) => Ok(()),
        Some(current) if current.repository_id() != repository.id => {
            Err(Error::ForeignRepository { entity })
        }
        Some(_) => Err(Error::AttachedElsewhere { entity }),
        None if operation.kind() == OperationKind::Insert => {
            state.attach(&operation.map, &operation.meta)
        }
        None => Err(Error::NotAttached { entity }),
    }
}

/// The map an entity touched by a cascade belongs to.
fn map_for(
    repository: &RepositoryCore,
    state: &mut RepositoryState,
    entity: &ErasedEntity,
) -> Result<Arc<dyn UberMap>> {
    if let Some(map) = entity.meta().and_then(|meta| meta.map()) {
        if map.repository_id() != repository.id {
            return Err(Error::ForeignRepository {
                entity: entity.type_name(),
            });
        }
        return Ok(map);
    }
    Ok(repository.locate_map(state, entity))
}

fn submit_dependency(
    repository: &RepositoryCore,
    state: &mut RepositoryState,
    entity: &ErasedEntity,
    kind: OperationKind,
    reason: &'static str,
) -> Result<()> {
    let map = map_for(repository, state, entity)?;
    let operation = OperationCore::new(kind, entity.clone(), map);
    tracing::trace!(
        kind = %kind,
        entity = entity.type_name(),
        reason,
        "Cascading"
    );
    submit(repository, state, &operation)
}

fn has_changes(entity: &ErasedEntity) -> Result<bool> {
    match entity.meta() {
        Some(meta) => Ok(meta.get_record_changes()?.is_some()),
        None => Ok(false),
    }
}

fn delete_if_live(
    repository: &RepositoryCore,
    state: &mut RepositoryState,
    child: &ErasedEntity,
    reason: &'static str,
) -> Result<()> {
    match child.state() {
        EntityState::Ready | EntityState::ToInsert | EntityState::ToUpdate => {
            submit_dependency(repository, state, child, OperationKind::Delete, reason)
        }
        EntityState::Collected | EntityState::Detached | EntityState::ToDelete => Ok(()),
    }
}

fn delete_children(
    repository: &RepositoryCore,
    state: &mut RepositoryState,
    operation: &OperationCore,
) -> Result<()> {
    for child in operation.meta.get_removed_childs() {
        delete_if_live(repository, state, &child, "removed child")?;
    }
    for child in operation.meta.get_dependencies(DependencyMode::Child) {
        delete_if_live(repository, state, &child, "child of deleted entity")?;
    }
    Ok(())
}

fn upsert_parents(
    repository: &RepositoryCore,
    state: &mut RepositoryState,
    operation: &OperationCore,
) -> Result<()> {
    for parent in operation.meta.get_dependencies(DependencyMode::Parent) {
        match parent.state() {
            EntityState::Detached => {
                submit_dependency(repository, state, &parent, OperationKind::Insert, "new parent")?;
            }
            EntityState::Ready if has_changes(&parent)? => {
                submit_dependency(repository, state, &parent, OperationKind::Update, "changed parent")?;
            }
            EntityState::ToDelete => {
                submit_dependency(repository, state, &parent, OperationKind::Insert, "parent needed again")?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn upsert_children(
    repository: &RepositoryCore,
    state: &mut RepositoryState,
    operation: &OperationCore,
) -> Result<()> {
    for child in operation.meta.get_dependencies(DependencyMode::Child) {
        match child.state() {
            EntityState::Detached => {
                submit_dependency(repository, state, &child, OperationKind::Insert, "new child")?;
            }
            EntityState::Ready if has_changes(&child)? => {
                submit_dependency(repository, state, &child, OperationKind::Update, "changed child")?;
            }
            _ => {}
        }
    }
    for child in operation.meta.get_removed_childs() {
        delete_if_live(repository, state, &child, "removed child")?;
    }
    Ok(())
}

fn refresh_parents(operation: &OperationCore) {
    for parent in operation.meta.get_dependencies(DependencyMode::Parent) {
        if let Some(meta) = parent.meta() {
            meta.set_to_refresh(true);
        }
    }
}
