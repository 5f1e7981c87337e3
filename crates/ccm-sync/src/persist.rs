//! Dedup-then-insert persistence into `ccm_generaciones`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use ccm_core::MissionaryRecord;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tracing::debug;

pub const TABLE_NAME: &str = "ccm_generaciones";

// 38 binds per row; Postgres caps one statement at 65535 binds.
const INSERT_CHUNK_ROWS: usize = 500;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Rejected(String),
}

/// Destination table keyed by the record id.
#[async_trait]
pub trait MissionaryTable: Send + Sync {
    /// Subset of `ids` already stored.
    async fn existing_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, PersistError>;

    /// Inserts every record in one transaction; on error nothing is kept.
    async fn insert_all(
        &self,
        records: &[MissionaryRecord],
        stamped_at: DateTime<Utc>,
    ) -> Result<(), PersistError>;
}

#[derive(Debug, Clone)]
pub struct PgMissionaryTable {
    pool: PgPool,
}

impl PgMissionaryTable {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MissionaryTable for PgMissionaryTable {
    async fn existing_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, PersistError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows: Vec<i64> = sqlx::query_scalar("SELECT id FROM ccm_generaciones WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn insert_all(
        &self,
        records: &[MissionaryRecord],
        stamped_at: DateTime<Utc>,
    ) -> Result<(), PersistError> {
        let mut tx = self.pool.begin().await?;

        for chunk in records.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO ccm_generaciones (id, id_distrito, tipo, rama, distrito, pais, \
                 numero_lista, numero_companerismo, tratamiento, nombre_misionero, companero, \
                 mision_asignada, estaca, hospedaje, foto, fecha_llegada, fecha_salida, \
                 fecha_generacion, comentarios, investido, fecha_nacimiento, foto_tomada, \
                 pasaporte, folio_pasaporte, fm, ipad, closet, llegada_secundaria, pday, host, \
                 tres_semanas, device, correo_misional, correo_personal, fecha_presencial, \
                 activo, created_at, updated_at) ",
            );
            builder.push_values(chunk, |mut row, r| {
                row.push_bind(r.id)
                    .push_bind(r.id_distrito.clone())
                    .push_bind(r.tipo.clone())
                    .push_bind(r.rama)
                    .push_bind(r.distrito.clone())
                    .push_bind(r.pais.clone())
                    .push_bind(r.numero_lista)
                    .push_bind(r.numero_companerismo)
                    .push_bind(r.tratamiento.clone())
                    .push_bind(r.nombre_misionero.clone())
                    .push_bind(r.companero.clone())
                    .push_bind(r.mision_asignada.clone())
                    .push_bind(r.estaca.clone())
                    .push_bind(r.hospedaje.clone())
                    .push_bind(r.foto.clone())
                    .push_bind(r.fecha_llegada)
                    .push_bind(r.fecha_salida)
                    .push_bind(r.fecha_generacion)
                    .push_bind(r.comentarios.clone())
                    .push_bind(r.investido)
                    .push_bind(r.fecha_nacimiento)
                    .push_bind(r.foto_tomada)
                    .push_bind(r.pasaporte)
                    .push_bind(r.folio_pasaporte.clone())
                    .push_bind(r.fm.clone())
                    .push_bind(r.ipad)
                    .push_bind(r.closet.clone())
                    .push_bind(r.llegada_secundaria.clone())
                    .push_bind(r.pday.clone())
                    .push_bind(r.host)
                    .push_bind(r.tres_semanas)
                    .push_bind(r.device)
                    .push_bind(r.correo_misional.clone())
                    .push_bind(r.correo_personal.clone())
                    .push_bind(r.fecha_presencial)
                    .push_bind(r.activo)
                    .push_bind(stamped_at)
                    .push_bind(stamped_at);
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PersistOutcome {
    pub inserted: usize,
    pub skipped: usize,
}

/// Inserts only records whose id is not stored yet, so replaying a file is a no-op.
#[derive(Clone)]
pub struct BatchPersister {
    table: Arc<dyn MissionaryTable>,
}

impl BatchPersister {
    pub fn new(table: Arc<dyn MissionaryTable>) -> Self {
        Self { table }
    }

    pub async fn persist(&self, records: &[MissionaryRecord]) -> Result<PersistOutcome, PersistError> {
        if records.is_empty() {
            return Ok(PersistOutcome::default());
        }

        let mut ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        ids.dedup();
        let existing = self.table.existing_ids(&ids).await?;

        // A repeated id inside the batch is kept once; later copies count as skipped.
        let mut seen = HashSet::with_capacity(records.len());
        let fresh: Vec<MissionaryRecord> = records
            .iter()
            .filter(|r| !existing.contains(&r.id) && seen.insert(r.id))
            .cloned()
            .collect();
        let skipped = records.len() - fresh.len();

        if fresh.is_empty() {
            debug!(skipped, "batch already stored");
            return Ok(PersistOutcome {
                inserted: 0,
                skipped,
            });
        }

        self.table.insert_all(&fresh, Utc::now()).await?;
        Ok(PersistOutcome {
            inserted: fresh.len(),
            skipped,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory table with the same all-or-nothing insert contract.
    #[derive(Default)]
    pub(crate) struct MemoryTable {
        pub rows: Mutex<BTreeMap<i64, (MissionaryRecord, DateTime<Utc>)>>,
        pub fail_inserts: AtomicBool,
        pub insert_calls: AtomicUsize,
    }

    impl MemoryTable {
        pub fn ids(&self) -> Vec<i64> {
            self.rows.lock().unwrap().keys().copied().collect()
        }
    }

    #[async_trait]
    impl MissionaryTable for MemoryTable {
        async fn existing_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, PersistError> {
            let rows = self.rows.lock().unwrap();
            Ok(ids.iter().copied().filter(|id| rows.contains_key(id)).collect())
        }

        async fn insert_all(
            &self,
            records: &[MissionaryRecord],
            stamped_at: DateTime<Utc>,
        ) -> Result<(), PersistError> {
            self.insert_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_inserts.load(Ordering::SeqCst) {
                return Err(PersistError::Rejected("connection reset".into()));
            }
            let mut rows = self.rows.lock().unwrap();
            if let Some(dup) = records.iter().find(|r| rows.contains_key(&r.id)) {
                return Err(PersistError::Rejected(format!("duplicate key {}", dup.id)));
            }
            for r in records {
                rows.insert(r.id, (r.clone(), stamped_at));
            }
            Ok(())
        }
    }

    fn batch(ids: &[i64]) -> Vec<MissionaryRecord> {
        ids.iter()
            .map(|id| MissionaryRecord::new(*id, format!("Elder {id}")))
            .collect()
    }

    #[tokio::test]
    async fn second_persist_of_same_batch_skips_everything() {
        let table = Arc::new(MemoryTable::default());
        let persister = BatchPersister::new(table.clone());
        let records = batch(&[1, 2, 3]);

        let first = persister.persist(&records).await.expect("first");
        assert_eq!(first, PersistOutcome { inserted: 3, skipped: 0 });

        let second = persister.persist(&records).await.expect("second");
        assert_eq!(second, PersistOutcome { inserted: 0, skipped: 3 });
        assert_eq!(table.insert_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn partially_stored_batch_inserts_only_new_ids() {
        let table = Arc::new(MemoryTable::default());
        let persister = BatchPersister::new(table.clone());
        persister.persist(&batch(&[1, 2])).await.expect("seed");

        let outcome = persister.persist(&batch(&[2, 3, 4])).await.expect("persist");
        assert_eq!(outcome, PersistOutcome { inserted: 2, skipped: 1 });
        assert_eq!(table.ids(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn repeated_ids_within_a_batch_are_skipped_not_conflicting() {
        let table = Arc::new(MemoryTable::default());
        let persister = BatchPersister::new(table.clone());

        let outcome = persister.persist(&batch(&[5, 5, 6])).await.expect("persist");
        assert_eq!(outcome, PersistOutcome { inserted: 2, skipped: 1 });
        assert_eq!(table.rows.lock().unwrap()[&5].0.nombre_misionero, "Elder 5");
    }

    #[tokio::test]
    async fn insert_failure_is_propagated_and_keeps_nothing() {
        let table = Arc::new(MemoryTable::default());
        table.fail_inserts.store(true, Ordering::SeqCst);
        let persister = BatchPersister::new(table.clone());

        let err = persister.persist(&batch(&[1, 2])).await.unwrap_err();
        assert!(matches!(err, PersistError::Rejected(_)));
        assert!(table.ids().is_empty());
    }

    #[tokio::test]
    async fn empty_batch_does_not_touch_storage() {
        let table = Arc::new(MemoryTable::default());
        let persister = BatchPersister::new(table.clone());
        let outcome = persister.persist(&[]).await.expect("persist");
        assert_eq!(outcome, PersistOutcome::default());
        assert_eq!(table.insert_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rows_share_one_timestamp_per_batch() {
        let table = Arc::new(MemoryTable::default());
        let persister = BatchPersister::new(table.clone());
        persister.persist(&batch(&[1, 2, 3])).await.expect("persist");

        let rows = table.rows.lock().unwrap();
        let stamps: HashSet<_> = rows.values().map(|(_, at)| *at).collect();
        assert_eq!(stamps.len(), 1);
    }
}
