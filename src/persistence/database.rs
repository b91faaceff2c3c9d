use crate::core::types::{
    Evidence, IcBundle, IdeaCard, IdeaStatus, NoveltyRecord, PacketFailure, ResearchPacket,
};
use crate::persistence::Store;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

/// Postgres store. Artifacts are kept as JSONB documents next to the few
/// columns the lanes filter on.
#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
}

fn observe<T, E>(table: &'static str, op: &'static str, start: Instant, res: &Result<T, E>) {
    let status = if res.is_ok() { "success" } else { "error" };
    metrics::counter!("database_queries_total", "table" => table, "op" => op, "status" => status)
        .increment(1);
    metrics::histogram!("database_query_duration_seconds", "table" => table, "op" => op)
        .record(start.elapsed().as_secs_f64());
}

impl Database {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string)
            .await?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ideas (
                id UUID PRIMARY KEY,
                ticker TEXT NOT NULL,
                status TEXT NOT NULL,
                doc JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS ideas_status_idx ON ideas (status)")
            .execute(&self.pool)
            .await?;

        // Write-once artifacts: plain INSERT, a duplicate id is an error.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS research_packets (
                id UUID PRIMARY KEY,
                idea_id UUID NOT NULL,
                ticker TEXT NOT NULL,
                doc JSONB NOT NULL,
                completed_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS evidence (
                id UUID PRIMARY KEY,
                packet_id UUID NOT NULL,
                doc JSONB NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS packet_failures (
                id UUID PRIMARY KEY,
                idea_id UUID NOT NULL,
                doc JSONB NOT NULL,
                failed_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ic_bundles (
                id UUID PRIMARY KEY,
                week_label TEXT NOT NULL,
                doc JSONB NOT NULL,
                window_end TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS novelty (
                ticker TEXT PRIMARY KEY,
                last_seen TIMESTAMPTZ NOT NULL,
                appearances INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = 'public'",
        )
        .fetch_all(&self.pool)
        .await?;

        info!(
            "Database tables initialized (Postgres). Found tables: {:?}",
            tables.iter().map(|t| &t.0).collect::<Vec<_>>()
        );
        Ok(())
    }
}

#[async_trait]
impl Store for Database {
    async fn upsert_idea(&self, idea: &IdeaCard) -> Result<()> {
        let start = Instant::now();
        let res = sqlx::query(
            r#"
            INSERT INTO ideas (id, ticker, status, doc, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                doc = EXCLUDED.doc,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(idea.id)
        .bind(&idea.ticker)
        .bind(idea.status.as_str())
        .bind(Json(idea))
        .bind(idea.created_at)
        .bind(idea.updated_at)
        .execute(&self.pool)
        .await;
        observe("ideas", "upsert", start, &res);
        res?;
        Ok(())
    }

    async fn get_idea(&self, id: Uuid) -> Result<Option<IdeaCard>> {
        let start = Instant::now();
        let res: Result<Option<(Json<IdeaCard>,)>, _> =
            sqlx::query_as("SELECT doc FROM ideas WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await;
        observe("ideas", "select", start, &res);
        Ok(res?.map(|(Json(idea),)| idea))
    }

    async fn ideas_with_status(&self, statuses: &[IdeaStatus]) -> Result<Vec<IdeaCard>> {
        let start = Instant::now();
        let wanted: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let res: Result<Vec<(Json<IdeaCard>,)>, _> = sqlx::query_as(
            "SELECT doc FROM ideas WHERE status = ANY($1) ORDER BY created_at, ticker",
        )
        .bind(wanted)
        .fetch_all(&self.pool)
        .await;
        observe("ideas", "select", start, &res);
        Ok(res?.into_iter().map(|(Json(idea),)| idea).collect())
    }

    async fn save_packet(&self, packet: &ResearchPacket) -> Result<()> {
        let start = Instant::now();
        let res = sqlx::query(
            r#"
            INSERT INTO research_packets (id, idea_id, ticker, doc, completed_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(packet.id)
        .bind(packet.idea_id)
        .bind(&packet.ticker)
        .bind(Json(packet))
        .bind(packet.completed_at)
        .execute(&self.pool)
        .await;
        observe("research_packets", "insert", start, &res);
        res?;
        Ok(())
    }

    async fn get_packet(&self, id: Uuid) -> Result<Option<ResearchPacket>> {
        let start = Instant::now();
        let res: Result<Option<(Json<ResearchPacket>,)>, _> =
            sqlx::query_as("SELECT doc FROM research_packets WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await;
        observe("research_packets", "select", start, &res);
        Ok(res?.map(|(Json(p),)| p))
    }

    async fn packets_completed_between(
        &self,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> Result<Vec<ResearchPacket>> {
        let start = Instant::now();
        let res: Result<Vec<(Json<ResearchPacket>,)>, _> = sqlx::query_as(
            r#"
            SELECT doc FROM research_packets
            WHERE completed_at >= $1 AND completed_at < $2
            ORDER BY completed_at
            "#,
        )
        .bind(start_at)
        .bind(end_at)
        .fetch_all(&self.pool)
        .await;
        observe("research_packets", "select", start, &res);
        Ok(res?.into_iter().map(|(Json(p),)| p).collect())
    }

    async fn append_evidence(&self, evidence: &[Evidence]) -> Result<()> {
        let start = Instant::now();
        let mut tx = self.pool.begin().await?;
        for e in evidence {
            let res = sqlx::query(
                "INSERT INTO evidence (id, packet_id, doc, recorded_at) VALUES ($1, $2, $3, $4)",
            )
            .bind(e.id)
            .bind(e.packet_id)
            .bind(Json(e))
            .bind(e.recorded_at)
            .execute(&mut *tx)
            .await;
            observe("evidence", "insert", start, &res);
            res?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn evidence_for_packet(&self, packet_id: Uuid) -> Result<Vec<Evidence>> {
        let start = Instant::now();
        let res: Result<Vec<(Json<Evidence>,)>, _> =
            sqlx::query_as("SELECT doc FROM evidence WHERE packet_id = $1 ORDER BY recorded_at")
                .bind(packet_id)
                .fetch_all(&self.pool)
                .await;
        observe("evidence", "select", start, &res);
        Ok(res?.into_iter().map(|(Json(e),)| e).collect())
    }

    async fn save_failure(&self, failure: &PacketFailure) -> Result<()> {
        let start = Instant::now();
        let res = sqlx::query(
            "INSERT INTO packet_failures (id, idea_id, doc, failed_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(failure.id)
        .bind(failure.idea_id)
        .bind(Json(failure))
        .bind(failure.failed_at)
        .execute(&self.pool)
        .await;
        observe("packet_failures", "insert", start, &res);
        res?;
        Ok(())
    }

    async fn failures_between(
        &self,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> Result<Vec<PacketFailure>> {
        let start = Instant::now();
        let res: Result<Vec<(Json<PacketFailure>,)>, _> = sqlx::query_as(
            r#"
            SELECT doc FROM packet_failures
            WHERE failed_at >= $1 AND failed_at < $2
            ORDER BY failed_at
            "#,
        )
        .bind(start_at)
        .bind(end_at)
        .fetch_all(&self.pool)
        .await;
        observe("packet_failures", "select", start, &res);
        Ok(res?.into_iter().map(|(Json(f),)| f).collect())
    }

    async fn save_bundle(&self, bundle: &IcBundle) -> Result<()> {
        let start = Instant::now();
        let res = sqlx::query(
            r#"
            INSERT INTO ic_bundles (id, week_label, doc, window_end, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(bundle.id)
        .bind(&bundle.week_label)
        .bind(Json(bundle))
        .bind(bundle.window_end)
        .bind(bundle.created_at)
        .execute(&self.pool)
        .await;
        observe("ic_bundles", "insert", start, &res);
        res?;
        Ok(())
    }

    async fn get_bundle(&self, id: Uuid) -> Result<Option<IcBundle>> {
        let start = Instant::now();
        let res: Result<Option<(Json<IcBundle>,)>, _> =
            sqlx::query_as("SELECT doc FROM ic_bundles WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await;
        observe("ic_bundles", "select", start, &res);
        Ok(res?.map(|(Json(b),)| b))
    }

    async fn latest_bundle(&self) -> Result<Option<IcBundle>> {
        let start = Instant::now();
        let res: Result<Option<(Json<IcBundle>,)>, _> = sqlx::query_as(
            "SELECT doc FROM ic_bundles ORDER BY window_end DESC, created_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await;
        observe("ic_bundles", "select", start, &res);
        Ok(res?.map(|(Json(b),)| b))
    }

    async fn upsert_novelty(&self, record: &NoveltyRecord) -> Result<()> {
        let start = Instant::now();
        let res = sqlx::query(
            r#"
            INSERT INTO novelty (ticker, last_seen, appearances)
            VALUES ($1, $2, $3)
            ON CONFLICT (ticker) DO UPDATE SET
                last_seen = EXCLUDED.last_seen,
                appearances = EXCLUDED.appearances
            "#,
        )
        .bind(&record.ticker)
        .bind(record.last_seen)
        .bind(i32::try_from(record.appearances).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await;
        observe("novelty", "upsert", start, &res);
        res?;
        Ok(())
    }

    async fn novelty_records(&self) -> Result<Vec<NoveltyRecord>> {
        let start = Instant::now();
        let res: Result<Vec<(String, DateTime<Utc>, i32)>, _> =
            sqlx::query_as("SELECT ticker, last_seen, appearances FROM novelty ORDER BY ticker")
                .fetch_all(&self.pool)
                .await;
        observe("novelty", "select", start, &res);
        Ok(res?
            .into_iter()
            .map(|(ticker, last_seen, appearances)| NoveltyRecord {
                ticker,
                last_seen,
                appearances: appearances.max(0) as u32,
            })
            .collect())
    }
}
