//! Postgres-backed sink. Tables are owned by the application's migrations;
//! this module only issues idempotent upserts against them.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;
use zlv_core::{
    BuildingRecord, HousingOwnerConflict, HousingOwnerLink, HousingRecord, OwnerConflict,
    OwnerIdentity, OwnerPatch,
};

use crate::{OwnerSink, SinkError};

const OWNER_COLUMNS: &str = "id, idpersonne, full_name, raw_address, birth_date, kind, siren, \
     blocking_key, data_source, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }
}

fn classify_sqlx_error(err: sqlx::Error) -> SinkError {
    let transient = match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        // serialization_failure, deadlock_detected
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("40001" | "40P01")),
        _ => false,
    };
    if transient {
        SinkError::Transient(err.to_string())
    } else {
        SinkError::Permanent(err.to_string())
    }
}

fn parse_column<T: std::str::FromStr>(raw: Option<String>) -> Result<Option<T>, SinkError>
where
    T::Err: std::fmt::Display,
{
    raw.map(|s| s.parse::<T>())
        .transpose()
        .map_err(|e| SinkError::Permanent(e.to_string()))
}

fn owner_from_row(row: &PgRow) -> Result<OwnerIdentity, SinkError> {
    Ok(OwnerIdentity {
        id: row.try_get("id").map_err(classify_sqlx_error)?,
        idpersonne: row.try_get("idpersonne").map_err(classify_sqlx_error)?,
        full_name: row.try_get("full_name").map_err(classify_sqlx_error)?,
        raw_address: row
            .try_get::<Option<Vec<String>>, _>("raw_address")
            .map_err(classify_sqlx_error)?
            .unwrap_or_default(),
        birth_date: row.try_get("birth_date").map_err(classify_sqlx_error)?,
        kind: parse_column(row.try_get("kind").map_err(classify_sqlx_error)?)?,
        siren: row.try_get("siren").map_err(classify_sqlx_error)?,
        blocking_key: row.try_get("blocking_key").map_err(classify_sqlx_error)?,
        data_source: row.try_get("data_source").map_err(classify_sqlx_error)?,
        created_at: row.try_get("created_at").map_err(classify_sqlx_error)?,
        updated_at: row.try_get("updated_at").map_err(classify_sqlx_error)?,
    })
}

fn link_from_row(row: &PgRow) -> Result<HousingOwnerLink, SinkError> {
    let property_right: String = row.try_get("property_right").map_err(classify_sqlx_error)?;
    Ok(HousingOwnerLink {
        owner_id: row.try_get("owner_id").map_err(classify_sqlx_error)?,
        geo_code: row.try_get("geo_code").map_err(classify_sqlx_error)?,
        local_id: row.try_get("local_id").map_err(classify_sqlx_error)?,
        idprocpte: row.try_get("idprocpte").map_err(classify_sqlx_error)?,
        idprodroit: row.try_get("idprodroit").map_err(classify_sqlx_error)?,
        rank: row.try_get("rank").map_err(classify_sqlx_error)?,
        property_right: property_right
            .parse()
            .map_err(|e: zlv_core::ParseEnumError| SinkError::Permanent(e.to_string()))?,
    })
}

#[async_trait]
impl OwnerSink for PgSink {
    async fn get_owner(&self, id: Uuid) -> Result<Option<OwnerIdentity>, SinkError> {
        let row = sqlx::query(&format!("SELECT {OWNER_COLUMNS} FROM owners WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        row.as_ref().map(owner_from_row).transpose()
    }

    async fn get_owner_by_external_id(
        &self,
        idpersonne: &str,
    ) -> Result<Option<OwnerIdentity>, SinkError> {
        let row = sqlx::query(&format!(
            "SELECT {OWNER_COLUMNS} FROM owners WHERE idpersonne = $1"
        ))
        .bind(idpersonne)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        row.as_ref().map(owner_from_row).transpose()
    }

    async fn find_owners_by_blocking_key(
        &self,
        blocking_key: &str,
    ) -> Result<Vec<OwnerIdentity>, SinkError> {
        let rows = sqlx::query(&format!(
            "SELECT {OWNER_COLUMNS} FROM owners WHERE blocking_key = $1 ORDER BY id"
        ))
        .bind(blocking_key)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        rows.iter().map(owner_from_row).collect()
    }

    async fn create_owner(&self, owner: &OwnerIdentity) -> Result<(), SinkError> {
        sqlx::query(
            r#"
            INSERT INTO owners (id, idpersonne, full_name, raw_address, birth_date, kind, siren,
                                blocking_key, data_source, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE
               SET idpersonne = EXCLUDED.idpersonne,
                   full_name = EXCLUDED.full_name,
                   raw_address = EXCLUDED.raw_address,
                   birth_date = EXCLUDED.birth_date,
                   kind = EXCLUDED.kind,
                   siren = EXCLUDED.siren,
                   blocking_key = EXCLUDED.blocking_key,
                   data_source = EXCLUDED.data_source,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(owner.id)
        .bind(owner.idpersonne.as_deref())
        .bind(&owner.full_name)
        .bind(owner.raw_address.clone())
        .bind(owner.birth_date)
        .bind(owner.kind.map(|k| k.as_str()))
        .bind(owner.siren.as_deref())
        .bind(owner.blocking_key.as_deref())
        .bind(owner.data_source.as_deref())
        .bind(owner.created_at)
        .bind(owner.updated_at)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        Ok(())
    }

    async fn update_owner(
        &self,
        id: Uuid,
        patch: &OwnerPatch,
    ) -> Result<OwnerIdentity, SinkError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE owners
               SET idpersonne = COALESCE($2, idpersonne),
                   full_name = COALESCE($3, full_name),
                   raw_address = COALESCE($4, raw_address),
                   birth_date = COALESCE($5, birth_date),
                   kind = COALESCE($6, kind),
                   siren = COALESCE($7, siren),
                   blocking_key = COALESCE($8, blocking_key),
                   data_source = COALESCE($9, data_source),
                   updated_at = NOW()
             WHERE id = $1
            RETURNING {OWNER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(patch.idpersonne.as_deref())
        .bind(patch.full_name.as_deref())
        .bind(patch.raw_address.clone())
        .bind(patch.birth_date)
        .bind(patch.kind.map(|k| k.as_str()))
        .bind(patch.siren.as_deref())
        .bind(patch.blocking_key.as_deref())
        .bind(patch.data_source.as_deref())
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        match row {
            Some(row) => owner_from_row(&row),
            None => Err(SinkError::OwnerNotFound(id)),
        }
    }

    async fn create_owner_conflict(&self, conflict: &OwnerConflict) -> Result<(), SinkError> {
        sqlx::query(
            r#"
            INSERT INTO owner_conflicts (id, existing_owner_id, fields, existing, replacement, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(conflict.id)
        .bind(conflict.existing_owner_id)
        .bind(conflict.fields.clone())
        .bind(Json(&conflict.existing))
        .bind(Json(&conflict.replacement))
        .bind(conflict.created_at)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        Ok(())
    }

    async fn get_housing_owner_link(
        &self,
        owner_id: Uuid,
        geo_code: &str,
        local_id: &str,
    ) -> Result<Option<HousingOwnerLink>, SinkError> {
        let row = sqlx::query(
            r#"
            SELECT owner_id, geo_code, local_id, idprocpte, idprodroit,
                   rank::BIGINT AS rank, property_right
              FROM owners_housing
             WHERE owner_id = $1 AND geo_code = $2 AND local_id = $3
            "#,
        )
        .bind(owner_id)
        .bind(geo_code)
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        row.as_ref().map(link_from_row).transpose()
    }

    async fn create_housing_owner_link(&self, link: &HousingOwnerLink) -> Result<(), SinkError> {
        sqlx::query(
            r#"
            INSERT INTO owners_housing (owner_id, geo_code, local_id, idprocpte, idprodroit, rank, property_right)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (owner_id, geo_code, local_id) DO NOTHING
            "#,
        )
        .bind(link.owner_id)
        .bind(&link.geo_code)
        .bind(&link.local_id)
        .bind(&link.idprocpte)
        .bind(&link.idprodroit)
        .bind(link.rank)
        .bind(link.property_right.as_str())
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        Ok(())
    }

    async fn update_housing_owner_link(&self, link: &HousingOwnerLink) -> Result<(), SinkError> {
        sqlx::query(
            r#"
            UPDATE owners_housing
               SET idprocpte = $4,
                   idprodroit = $5,
                   rank = $6,
                   property_right = $7
             WHERE owner_id = $1 AND geo_code = $2 AND local_id = $3
            "#,
        )
        .bind(link.owner_id)
        .bind(&link.geo_code)
        .bind(&link.local_id)
        .bind(&link.idprocpte)
        .bind(&link.idprodroit)
        .bind(link.rank)
        .bind(link.property_right.as_str())
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        Ok(())
    }

    async fn create_housing_owner_conflict(
        &self,
        conflict: &HousingOwnerConflict,
    ) -> Result<(), SinkError> {
        sqlx::query(
            r#"
            INSERT INTO housing_owner_conflicts (id, owner_id, geo_code, local_id, existing, replacement, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(conflict.id)
        .bind(conflict.owner_id)
        .bind(&conflict.geo_code)
        .bind(&conflict.local_id)
        .bind(Json(&conflict.existing))
        .bind(Json(&conflict.replacement))
        .bind(conflict.created_at)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        Ok(())
    }

    async fn upsert_housing(&self, housing: &HousingRecord) -> Result<(), SinkError> {
        sqlx::query(
            r#"
            INSERT INTO housing (geo_code, local_id, invariant, building_id, raw_address, living_area,
                                 rooms_count, vacancy_start_year, occupancy, data_source)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (geo_code, local_id) DO UPDATE
               SET invariant = EXCLUDED.invariant,
                   building_id = EXCLUDED.building_id,
                   raw_address = EXCLUDED.raw_address,
                   living_area = EXCLUDED.living_area,
                   rooms_count = EXCLUDED.rooms_count,
                   vacancy_start_year = EXCLUDED.vacancy_start_year,
                   occupancy = EXCLUDED.occupancy,
                   data_source = EXCLUDED.data_source
            "#,
        )
        .bind(&housing.geo_code)
        .bind(&housing.local_id)
        .bind(housing.invariant.as_deref())
        .bind(housing.building_id.as_deref())
        .bind(housing.raw_address.clone())
        .bind(housing.living_area)
        .bind(housing.rooms_count)
        .bind(housing.vacancy_start_year)
        .bind(housing.occupancy.as_str())
        .bind(housing.data_source.as_deref())
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        Ok(())
    }

    async fn upsert_building(&self, building: &BuildingRecord) -> Result<(), SinkError> {
        sqlx::query(
            r#"
            INSERT INTO buildings (id, geo_code, housing_count, vacant_housing_count, dpe_class, dpe_date)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
               SET geo_code = EXCLUDED.geo_code,
                   housing_count = EXCLUDED.housing_count,
                   vacant_housing_count = EXCLUDED.vacant_housing_count,
                   dpe_class = EXCLUDED.dpe_class,
                   dpe_date = EXCLUDED.dpe_date
            "#,
        )
        .bind(&building.building_id)
        .bind(&building.geo_code)
        .bind(building.housing_count)
        .bind(building.vacant_housing_count)
        .bind(building.dpe_class.map(|c| c.as_str()))
        .bind(building.dpe_date)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        Ok(())
    }
}
