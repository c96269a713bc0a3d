use indexmap::IndexSet;

use audit_value::{Value, normalize};

use crate::client::DbClient;
use crate::config::{AggregateConfig, AuditConfig};
use crate::error::{AuditError, Phase};
use crate::model::ResolvedId;

/// Resolves every `(category, type, id)` triple a record should be logged
/// under: itself (unless `excludeSelf`) plus every declared aggregate root,
/// per spec.md §4.5. A model with no registered [`EntityConfig`] resolves to
/// no ids at all — such records never produce a log.
pub async fn resolve_ids(
    model: &str,
    record: &Value,
    config: &AuditConfig,
    client: &dyn DbClient,
) -> Result<Vec<ResolvedId>, AuditError> {
    let Some(entity) = config.aggregate_mapping.get(model) else {
        return Ok(Vec::new());
    };

    // `IndexSet` rather than a sorted set: spec.md §4.5 requires aggregates
    // to come out in declaration order (self id first, then each
    // `EntityConfig::aggregate` in the order it was registered), not sorted.
    let mut ids = IndexSet::new();

    if !entity.exclude_self {
        if let Some(raw_id) = (entity.id_resolver)(record) {
            match normalize(&raw_id) {
                Ok(normalized) => {
                    ids.insert(ResolvedId {
                        aggregate_category: entity.category.clone(),
                        aggregate_type: entity.entity_type.clone(),
                        aggregate_id: normalized,
                    });
                }
                Err(err) => {
                    config.handle(
                        Phase::Resolver,
                        model,
                        "self",
                        AuditError::Resolver {
                            phase: Phase::Resolver,
                            message: format!("could not normalize self id: {err}"),
                        },
                    )?;
                }
            }
        }
    }

    for root in &entity.aggregates {
        let resolved = (root.resolve)(record, client).await;
        let raw_id = match resolved {
            Ok(Some(id)) => id,
            Ok(None) => continue,
            Err(err) => {
                config.handle(Phase::Resolver, model, &root.r#type, err)?;
                continue;
            }
        };
        match normalize(&raw_id) {
            Ok(normalized) => {
                ids.insert(ResolvedId {
                    aggregate_category: root.category.clone(),
                    aggregate_type: root.r#type.clone(),
                    aggregate_id: normalized,
                });
            }
            Err(err) => {
                config.handle(
                    Phase::Resolver,
                    model,
                    &root.r#type,
                    AuditError::Resolver {
                        phase: Phase::Resolver,
                        message: format!("could not normalize {}.id: {err}", root.r#type),
                    },
                )?;
            }
        }
    }

    Ok(ids.into_iter().collect())
}

/// True if `model` would resolve to at least one id under `config`, without
/// actually running any resolver — used to skip entities up front rather
/// than after paying for a pre-fetch.
pub fn is_loggable(model: &str, config: &AggregateConfig) -> bool {
    config.is_registered(model)
}
