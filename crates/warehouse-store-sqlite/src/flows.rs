use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use warehouse_core::access::{Permission, Principal};
use warehouse_core::audit::{AuditEventType, EntityType, NewAuditEvent};
use warehouse_core::flow::{
    ensure_no_open_draft, FlowDefinition, FlowStatus, FlowSummary, FlowVersion, GraphSchema,
    NewFlow, PublishOutcome,
};
use warehouse_core::{now_utc, FlowDefinitionId, FlowVersionId, Page, WarehouseError};

use crate::{
    append_audit, authorize, begin_write, code_column, collect_rows, column_error, id_column,
    is_unique_violation, not_found, opt_timestamp_column, sql_timestamp, timestamp_column,
    SqliteWarehouseStore,
};

const VERSION_COLUMNS: &str = "id, flow_definition_id, version_num, status, graph_schema,
    created_by, reviewed_by, published_at, published_by, created_at";

const FLOW_COLUMNS: &str = "id, name_json, description, created_by, created_at, updated_at";

impl SqliteWarehouseStore {
    /// Creates a flow definition together with its empty version 1 draft.
    pub fn create_flow(
        &mut self,
        actor: &Principal,
        new: &NewFlow,
    ) -> Result<(FlowDefinition, FlowVersion)> {
        authorize(actor, Permission::EditFlows)?;
        new.validate()?;

        let now = now_utc();
        let flow = FlowDefinition {
            id: FlowDefinitionId::new(),
            name: new.name.clone(),
            description: new
                .description
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
            created_by: actor.user_id.clone(),
            created_at: now,
            updated_at: now,
        };

        let tx = begin_write(&mut self.conn)
            .context("failed to start flow creation transaction")?;
        tx.execute(
            "INSERT INTO flow_definitions(id, name_json, description, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                flow.id.to_string(),
                serde_json::to_string(&flow.name).context("failed to serialize flow name")?,
                flow.description,
                flow.created_by,
                sql_timestamp(now)?,
            ],
        )
        .context("failed to insert flow definition")?;
        let draft = insert_version(&tx, flow.id, 1, &GraphSchema::empty(), &actor.user_id)?;

        append_audit(
            &tx,
            &NewAuditEvent::new(AuditEventType::FlowCreated, EntityType::FlowDefinition, flow.id)
                .by(&actor.user_id)
                .new_state(json!({"name": flow.name, "draft_version_id": draft.id.to_string()})),
        )?;
        tx.commit().context("failed to commit flow creation")?;

        tracing::info!(flow_id = %flow.id, "flow created");
        Ok((flow, draft))
    }

    /// Replaces the graph of a DRAFT version.
    pub fn update_draft(
        &mut self,
        actor: &Principal,
        version_id: FlowVersionId,
        graph: &GraphSchema,
    ) -> Result<FlowVersion> {
        authorize(actor, Permission::EditFlows)?;
        let tx = begin_write(&mut self.conn)
            .context("failed to start draft update transaction")?;
        let mut version = load_version(&tx, version_id)?;
        version.ensure_editable()?;

        tx.execute(
            "UPDATE flow_versions SET graph_schema = ?2 WHERE id = ?1",
            params![version.id.to_string(), graph_json(graph)?],
        )
        .with_context(|| format!("failed to update flow version {version_id}"))?;
        touch_flow(&tx, version.flow_definition_id)?;
        append_audit(
            &tx,
            &NewAuditEvent::new(
                AuditEventType::FlowVersionUpdated,
                EntityType::FlowVersion,
                version.id,
            )
            .by(&actor.user_id)
            .metadata(json!({
                "version_num": version.version_num,
                "node_count": graph.nodes.len(),
                "edge_count": graph.edges.len(),
            })),
        )?;
        tx.commit().context("failed to commit draft update")?;

        version.graph_schema = graph.clone();
        tracing::info!(version_id = %version.id, "flow draft updated");
        Ok(version)
    }

    pub fn submit_for_review(
        &mut self,
        actor: &Principal,
        version_id: FlowVersionId,
    ) -> Result<FlowVersion> {
        authorize(actor, Permission::EditFlows)?;
        let tx = begin_write(&mut self.conn)
            .context("failed to start review submission transaction")?;
        let mut version = load_version(&tx, version_id)?;
        version.ensure_submittable()?;

        set_status(&tx, version.id, FlowStatus::Review)?;
        append_audit(
            &tx,
            &status_event(
                AuditEventType::FlowVersionSubmitted,
                &version,
                FlowStatus::Review,
                actor,
            ),
        )?;
        tx.commit().context("failed to commit review submission")?;

        version.status = FlowStatus::Review;
        tracing::info!(version_id = %version.id, "flow version submitted for review");
        Ok(version)
    }

    /// Publishes a DRAFT or REVIEW version and opens the next draft.
    ///
    /// When another draft is already open, no new draft is created.
    pub fn publish_version(
        &mut self,
        actor: &Principal,
        version_id: FlowVersionId,
    ) -> Result<PublishOutcome> {
        authorize(actor, Permission::PublishFlows)?;
        let tx = begin_write(&mut self.conn)
            .context("failed to start publish transaction")?;
        let mut version = load_version(&tx, version_id)?;
        version.ensure_publishable()?;

        let now = now_utc();
        if version.status == FlowStatus::Review {
            version.reviewed_by = Some(actor.user_id.clone());
        }
        tx.execute(
            "UPDATE flow_versions
             SET status = 'PUBLISHED', published_at = ?2, published_by = ?3, reviewed_by = ?4
             WHERE id = ?1",
            params![
                version.id.to_string(),
                sql_timestamp(now)?,
                actor.user_id,
                version.reviewed_by,
            ],
        )
        .with_context(|| format!("failed to publish flow version {version_id}"))?;
        let previous_status = version.status;
        version.status = FlowStatus::Published;
        version.published_at = Some(now);
        version.published_by = Some(actor.user_id.clone());

        let new_draft = if open_draft(&tx, version.flow_definition_id)?.is_some() {
            None
        } else {
            let next = next_version_num(&tx, version.flow_definition_id)?;
            Some(insert_version(
                &tx,
                version.flow_definition_id,
                next,
                &version.graph_schema,
                &actor.user_id,
            )?)
        };
        touch_flow(&tx, version.flow_definition_id)?;

        append_audit(
            &tx,
            &NewAuditEvent::new(
                AuditEventType::FlowVersionPublished,
                EntityType::FlowVersion,
                version.id,
            )
            .by(&actor.user_id)
            .old_state(json!({"status": previous_status.as_str()}))
            .new_state(json!({"status": FlowStatus::Published.as_str()}))
            .metadata(json!({
                "version_num": version.version_num,
                "new_draft_version_num": new_draft.as_ref().map(|draft| draft.version_num),
            })),
        )?;
        tx.commit().context("failed to commit publish")?;

        tracing::info!(
            version_id = %version.id,
            version_num = version.version_num,
            new_draft = ?new_draft.as_ref().map(|draft| draft.version_num),
            "flow version published"
        );
        Ok(PublishOutcome {
            published_version: version,
            new_draft,
        })
    }

    /// Copies any version's graph into a new DRAFT numbered after the latest.
    pub fn fork_version(
        &mut self,
        actor: &Principal,
        version_id: FlowVersionId,
    ) -> Result<FlowVersion> {
        authorize(actor, Permission::EditFlows)?;
        let tx = begin_write(&mut self.conn)
            .context("failed to start fork transaction")?;
        let source = load_version(&tx, version_id)?;
        ensure_no_open_draft(open_draft(&tx, source.flow_definition_id)?)?;

        let next = next_version_num(&tx, source.flow_definition_id)?;
        let draft = insert_version(
            &tx,
            source.flow_definition_id,
            next,
            &source.graph_schema,
            &actor.user_id,
        )?;
        touch_flow(&tx, source.flow_definition_id)?;
        append_audit(
            &tx,
            &NewAuditEvent::new(
                AuditEventType::FlowVersionForked,
                EntityType::FlowVersion,
                draft.id,
            )
            .by(&actor.user_id)
            .metadata(json!({
                "source_version_id": source.id.to_string(),
                "source_version_num": source.version_num,
                "version_num": draft.version_num,
            })),
        )?;
        tx.commit().context("failed to commit fork")?;

        tracing::info!(version_id = %draft.id, from = source.version_num, "flow version forked");
        Ok(draft)
    }

    pub fn deprecate_version(
        &mut self,
        actor: &Principal,
        version_id: FlowVersionId,
    ) -> Result<FlowVersion> {
        authorize(actor, Permission::PublishFlows)?;
        let tx = begin_write(&mut self.conn)
            .context("failed to start deprecation transaction")?;
        let mut version = load_version(&tx, version_id)?;
        version.ensure_deprecatable()?;

        set_status(&tx, version.id, FlowStatus::Deprecated)?;
        append_audit(
            &tx,
            &status_event(
                AuditEventType::FlowVersionDeprecated,
                &version,
                FlowStatus::Deprecated,
                actor,
            ),
        )?;
        tx.commit().context("failed to commit deprecation")?;

        version.status = FlowStatus::Deprecated;
        tracing::info!(version_id = %version.id, "flow version deprecated");
        Ok(version)
    }

    pub fn get_flow(&self, flow_id: FlowDefinitionId) -> Result<FlowDefinition> {
        self.conn
            .query_row(
                &format!("SELECT {FLOW_COLUMNS} FROM flow_definitions WHERE id = ?1"),
                params![flow_id.to_string()],
                parse_flow_row,
            )
            .optional()
            .with_context(|| format!("failed to load flow {flow_id}"))?
            .ok_or_else(|| not_found("Flow definition", flow_id))
    }

    /// Flows newest first, each with its latest and published version numbers.
    pub fn list_flows(&self, page: Page) -> Result<Vec<FlowSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT d.id, d.name_json, d.description, d.created_by, d.created_at, d.updated_at,
                        (SELECT MAX(v.version_num) FROM flow_versions v
                          WHERE v.flow_definition_id = d.id),
                        (SELECT v.status FROM flow_versions v
                          WHERE v.flow_definition_id = d.id
                          ORDER BY v.version_num DESC LIMIT 1),
                        (SELECT MAX(v.version_num) FROM flow_versions v
                          WHERE v.flow_definition_id = d.id AND v.status = 'PUBLISHED'),
                        (SELECT COUNT(*) FROM flow_versions v
                          WHERE v.flow_definition_id = d.id)
                 FROM flow_definitions d
                 ORDER BY d.rowid DESC
                 LIMIT ?1 OFFSET ?2",
            )
            .context("failed to prepare flow listing")?;
        let rows = stmt
            .query_map(params![page.limit, page.offset], |row| {
                let latest_status: Option<String> = row.get(7)?;
                Ok(FlowSummary {
                    flow: parse_flow_row(row)?,
                    latest_version_num: opt_version_column(row, 6)?,
                    latest_status: latest_status
                        .map(|raw| {
                            FlowStatus::parse(&raw)
                                .ok_or_else(|| column_error(7, format!("invalid flow status: {raw}")))
                        })
                        .transpose()?,
                    published_version_num: opt_version_column(row, 8)?,
                    version_count: version_column(row, 9)?,
                })
            })
            .context("failed to list flows")?;
        collect_rows(rows)
    }

    /// Versions of one flow, newest version number first.
    pub fn list_versions(&self, flow_id: FlowDefinitionId) -> Result<Vec<FlowVersion>> {
        self.get_flow(flow_id)?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {VERSION_COLUMNS} FROM flow_versions
                 WHERE flow_definition_id = ?1
                 ORDER BY version_num DESC"
            ))
            .context("failed to prepare version listing")?;
        let rows = stmt
            .query_map(params![flow_id.to_string()], parse_version_row)
            .context("failed to list flow versions")?;
        collect_rows(rows)
    }

    pub fn get_version(&self, version_id: FlowVersionId) -> Result<FlowVersion> {
        load_version(&self.conn, version_id)
    }

    pub fn latest_draft(&self, flow_id: FlowDefinitionId) -> Result<Option<FlowVersion>> {
        self.get_flow(flow_id)?;
        self.conn
            .query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM flow_versions
                     WHERE flow_definition_id = ?1 AND status = 'DRAFT'
                     ORDER BY version_num DESC LIMIT 1"
                ),
                params![flow_id.to_string()],
                parse_version_row,
            )
            .optional()
            .with_context(|| format!("failed to load draft of flow {flow_id}"))
    }
}

pub(crate) fn load_version(conn: &Connection, version_id: FlowVersionId) -> Result<FlowVersion> {
    conn.query_row(
        &format!("SELECT {VERSION_COLUMNS} FROM flow_versions WHERE id = ?1"),
        params![version_id.to_string()],
        parse_version_row,
    )
    .optional()
    .with_context(|| format!("failed to load flow version {version_id}"))?
    .ok_or_else(|| not_found("Flow version", version_id))
}

fn insert_version(
    conn: &Connection,
    flow_id: FlowDefinitionId,
    version_num: u32,
    graph: &GraphSchema,
    created_by: &str,
) -> Result<FlowVersion> {
    let now = now_utc();
    let version = FlowVersion {
        id: FlowVersionId::new(),
        flow_definition_id: flow_id,
        version_num,
        status: FlowStatus::Draft,
        graph_schema: graph.clone(),
        created_by: created_by.to_string(),
        reviewed_by: None,
        published_at: None,
        published_by: None,
        created_at: now,
    };
    let inserted = conn.execute(
        "INSERT INTO flow_versions(
            id, flow_definition_id, version_num, status, graph_schema, created_by, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            version.id.to_string(),
            flow_id.to_string(),
            version_num,
            version.status.as_str(),
            graph_json(graph)?,
            created_by,
            sql_timestamp(now)?,
        ],
    );
    match inserted {
        Ok(_) => Ok(version),
        Err(err) if is_unique_violation(&err, "flow_versions.flow_definition_id") => {
            Err(WarehouseError::Conflict(format!(
                "A draft or version v{version_num} already exists for flow {flow_id}"
            ))
            .into())
        }
        Err(err) => Err(err).context("failed to insert flow version"),
    }
}

fn open_draft(conn: &Connection, flow_id: FlowDefinitionId) -> Result<Option<u32>> {
    let raw: Option<i64> = conn
        .query_row(
            "SELECT version_num FROM flow_versions
             WHERE flow_definition_id = ?1 AND status = 'DRAFT'",
            params![flow_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .context("failed to look up open draft")?;
    raw.map(|value| {
        u32::try_from(value).with_context(|| format!("invalid stored version_num {value}"))
    })
    .transpose()
}

fn next_version_num(conn: &Connection, flow_id: FlowDefinitionId) -> Result<u32> {
    let max: Option<i64> = conn
        .query_row(
            "SELECT MAX(version_num) FROM flow_versions WHERE flow_definition_id = ?1",
            params![flow_id.to_string()],
            |row| row.get(0),
        )
        .context("failed to read latest version number")?;
    let next = max.unwrap_or(0) + 1;
    u32::try_from(next).with_context(|| format!("version number {next} out of range"))
}

fn set_status(conn: &Connection, version_id: FlowVersionId, status: FlowStatus) -> Result<()> {
    conn.execute(
        "UPDATE flow_versions SET status = ?2 WHERE id = ?1",
        params![version_id.to_string(), status.as_str()],
    )
    .with_context(|| format!("failed to set flow version {version_id} to {status}"))?;
    Ok(())
}

fn touch_flow(conn: &Connection, flow_id: FlowDefinitionId) -> Result<()> {
    conn.execute(
        "UPDATE flow_definitions SET updated_at = ?2 WHERE id = ?1",
        params![flow_id.to_string(), sql_timestamp(now_utc())?],
    )
    .with_context(|| format!("failed to touch flow {flow_id}"))?;
    Ok(())
}

fn status_event(
    event_type: AuditEventType,
    version: &FlowVersion,
    next: FlowStatus,
    actor: &Principal,
) -> NewAuditEvent {
    NewAuditEvent::new(event_type, EntityType::FlowVersion, version.id)
        .by(&actor.user_id)
        .old_state(json!({"status": version.status.as_str()}))
        .new_state(json!({"status": next.as_str()}))
        .metadata(json!({"version_num": version.version_num}))
}

fn graph_json(graph: &GraphSchema) -> Result<String> {
    serde_json::to_string(graph).context("failed to serialize flow graph")
}

fn version_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u32> {
    let raw: i64 = row.get(idx)?;
    u32::try_from(raw).map_err(|_| column_error(idx, format!("invalid version number: {raw}")))
}

fn opt_version_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<u32>> {
    let raw: Option<i64> = row.get(idx)?;
    raw.map(|value| {
        u32::try_from(value)
            .map_err(|_| column_error(idx, format!("invalid version number: {value}")))
    })
    .transpose()
}

fn parse_flow_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FlowDefinition> {
    let name: String = row.get(1)?;
    Ok(FlowDefinition {
        id: id_column(row, 0, FlowDefinitionId::parse)?,
        name: serde_json::from_str(&name)
            .map_err(|err| column_error(1, format!("invalid flow name: {err}")))?,
        description: row.get(2)?,
        created_by: row.get(3)?,
        created_at: timestamp_column(row, 4)?,
        updated_at: timestamp_column(row, 5)?,
    })
}

fn parse_version_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FlowVersion> {
    let graph: String = row.get(4)?;
    Ok(FlowVersion {
        id: id_column(row, 0, FlowVersionId::parse)?,
        flow_definition_id: id_column(row, 1, FlowDefinitionId::parse)?,
        version_num: version_column(row, 2)?,
        status: code_column(row, 3, FlowStatus::parse, "flow status")?,
        graph_schema: serde_json::from_str(&graph)
            .map_err(|err| column_error(4, format!("invalid graph_schema: {err}")))?,
        created_by: row.get(5)?,
        reviewed_by: row.get(6)?,
        published_at: opt_timestamp_column(row, 7)?,
        published_by: row.get(8)?,
        created_at: timestamp_column(row, 9)?,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::manual_let_else, clippy::float_cmp, clippy::too_many_lines)]

    use std::collections::BTreeMap;

    use warehouse_core::access::Role;

    use super::*;
    use crate::fixtures::{
        admin, failure_code, fixture_store, must, must_fail, operator, publishable_graph,
    };

    fn new_flow(store: &mut SqliteWarehouseStore) -> (FlowDefinition, FlowVersion) {
        must(store.create_flow(
            &operator(),
            &NewFlow {
                name: BTreeMap::from([
                    ("en".to_string(), "Skewer line".to_string()),
                    ("de".to_string(), "Spiesslinie".to_string()),
                ]),
                description: Some("  main line  ".to_string()),
            },
        ))
    }

    #[test]
    fn create_flow_opens_empty_first_draft() {
        let mut store = fixture_store();
        let (flow, draft) = new_flow(&mut store);
        assert_eq!(flow.description.as_deref(), Some("main line"));
        assert_eq!(draft.version_num, 1);
        assert_eq!(draft.status, FlowStatus::Draft);
        assert!(draft.graph_schema.nodes.is_empty());
        assert_eq!(draft.graph_schema.viewport.zoom, 1.0);

        let loaded = must(store.get_version(draft.id));
        assert_eq!(loaded.id, draft.id);
        assert_eq!(loaded.graph_schema, draft.graph_schema);
        assert_eq!(must(store.latest_draft(flow.id)).map(|v| v.id), Some(draft.id));
    }

    #[test]
    fn publish_freezes_version_and_opens_next_draft() {
        let mut store = fixture_store();
        let (flow, draft) = new_flow(&mut store);
        must(store.update_draft(&operator(), draft.id, &publishable_graph()));

        assert_eq!(
            failure_code(store.publish_version(&operator(), draft.id)),
            "forbidden"
        );
        let outcome = must(store.publish_version(&admin(), draft.id));
        assert_eq!(outcome.published_version.status, FlowStatus::Published);
        assert_eq!(outcome.published_version.published_by.as_deref(), Some("u-admin"));
        let next = match outcome.new_draft {
            Some(next) => next,
            None => panic!("publish must open a new draft"),
        };
        assert_eq!(next.version_num, 2);
        assert_eq!(next.graph_schema, publishable_graph());

        let err = must_fail(store.update_draft(&operator(), draft.id, &GraphSchema::empty()));
        assert!(err
            .to_string()
            .contains("Cannot edit PUBLISHED version. Only DRAFT versions can be modified."));
        assert_eq!(
            failure_code(store.update_draft(&operator(), draft.id, &GraphSchema::empty())),
            "forbidden"
        );

        let summaries = must(store.list_flows(Page::default()));
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].flow.id, flow.id);
        assert_eq!(summaries[0].latest_version_num, Some(2));
        assert_eq!(summaries[0].latest_status, Some(FlowStatus::Draft));
        assert_eq!(summaries[0].published_version_num, Some(1));
        assert_eq!(summaries[0].version_count, 2);
    }

    #[test]
    fn publish_validates_graph_before_any_effect() {
        let mut store = fixture_store();
        let (_, draft) = new_flow(&mut store);
        let err = must_fail(store.publish_version(&admin(), draft.id));
        assert!(err.to_string().contains("at least one START node"));

        let mut dangling = publishable_graph();
        dangling.edges[0].target = "ghost".to_string();
        must(store.update_draft(&operator(), draft.id, &dangling));
        let err = must_fail(store.publish_version(&admin(), draft.id));
        assert!(err.to_string().contains("non-existent target: ghost"));
        assert_eq!(must(store.get_version(draft.id)).status, FlowStatus::Draft);
    }

    #[test]
    fn review_path_records_reviewer() {
        let mut store = fixture_store();
        let (_, draft) = new_flow(&mut store);
        must(store.update_draft(&operator(), draft.id, &publishable_graph()));
        let reviewed = must(store.submit_for_review(&operator(), draft.id));
        assert_eq!(reviewed.status, FlowStatus::Review);
        assert_eq!(
            failure_code(store.submit_for_review(&operator(), draft.id)),
            "precondition_failed"
        );

        let manager = Principal::new("u-manager", Role::Manager);
        let outcome = must(store.publish_version(&manager, draft.id));
        assert_eq!(outcome.published_version.reviewed_by.as_deref(), Some("u-manager"));
        assert!(outcome.new_draft.is_some());
    }

    #[test]
    fn fork_conflicts_while_a_draft_is_open() {
        let mut store = fixture_store();
        let (flow, draft) = new_flow(&mut store);
        must(store.update_draft(&operator(), draft.id, &publishable_graph()));
        let published = must(store.publish_version(&admin(), draft.id)).published_version;

        let err = must_fail(store.fork_version(&operator(), published.id));
        assert!(err
            .to_string()
            .contains("A draft version (v2) already exists. Edit that or deprecate it first."));

        let open = match must(store.latest_draft(flow.id)) {
            Some(open) => open,
            None => panic!("draft v2 must exist"),
        };
        must(store.submit_for_review(&operator(), open.id));
        let forked = must(store.fork_version(&operator(), published.id));
        assert_eq!(forked.version_num, 3);
        assert_eq!(forked.graph_schema, published.graph_schema);

        let versions = must(store.list_versions(flow.id));
        assert_eq!(
            versions.iter().map(|v| v.version_num).collect::<Vec<_>>(),
            vec![3, 2, 1]
        );
    }

    #[test]
    fn deprecate_only_from_published() {
        let mut store = fixture_store();
        let (_, draft) = new_flow(&mut store);
        assert_eq!(
            failure_code(store.deprecate_version(&admin(), draft.id)),
            "precondition_failed"
        );
        must(store.update_draft(&operator(), draft.id, &publishable_graph()));
        must(store.publish_version(&admin(), draft.id));
        let deprecated = must(store.deprecate_version(&admin(), draft.id));
        assert_eq!(deprecated.status, FlowStatus::Deprecated);
        assert_eq!(
            failure_code(store.publish_version(&admin(), draft.id)),
            "precondition_failed"
        );
    }

    #[test]
    fn storage_rejects_published_graph_edits_and_deletes() {
        let mut store = fixture_store();
        let (_, draft) = new_flow(&mut store);
        must(store.update_draft(&operator(), draft.id, &publishable_graph()));
        must(store.publish_version(&admin(), draft.id));

        let edit = store.connection().execute(
            "UPDATE flow_versions SET graph_schema = '{}' WHERE id = ?1",
            params![draft.id.to_string()],
        );
        assert!(edit.is_err());
        let revert = store.connection().execute(
            "UPDATE flow_versions SET status = 'DRAFT' WHERE id = ?1",
            params![draft.id.to_string()],
        );
        assert!(revert.is_err());
        let delete = store.connection().execute(
            "DELETE FROM flow_versions WHERE id = ?1",
            params![draft.id.to_string()],
        );
        assert!(delete.is_err());
        let deprecate = store.connection().execute(
            "UPDATE flow_versions SET status = 'DEPRECATED' WHERE id = ?1",
            params![draft.id.to_string()],
        );
        assert!(deprecate.is_ok());
    }
}
