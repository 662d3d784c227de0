//! Candidate repository implementation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use candex_core::{
    BackfillScope, CandidateAttributes, CandidateField, CandidatePatch, CandidateRepository,
    CandidateSource, CanonicalCandidate, EducationEntry, EmbeddingStatus, EmploymentEntry, Error,
    FieldValue, LifecycleStatus, Result,
};

const CANDIDATE_COLUMNS: &str = "id, source, first_name, last_name, email, phone, linkedin_url, \
     current_title, current_company, headline, bio, detailed_history, cv_text, skills, \
     employment_history, education_history, ats_enhanced, field_sources, lifecycle, \
     embedding_status, created_at, updated_at";

/// PostgreSQL implementation of CandidateRepository.
pub struct PgCandidateRepository {
    pool: Pool<Postgres>,
}

impl PgCandidateRepository {
    /// Create a new PgCandidateRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Parse a candidate row. External ids are loaded separately.
    fn parse_row(row: &PgRow) -> Result<CanonicalCandidate> {
        let source: String = row.get("source");
        let lifecycle: String = row.get("lifecycle");
        let embedding_status: String = row.get("embedding_status");
        let employment: Json<Vec<EmploymentEntry>> = row.get("employment_history");
        let education: Json<Vec<EducationEntry>> = row.get("education_history");
        let field_sources: Json<BTreeMap<CandidateField, CandidateSource>> =
            row.get("field_sources");

        Ok(CanonicalCandidate {
            id: row.get("id"),
            source: source.parse()?,
            external_ids: BTreeMap::new(),
            attributes: CandidateAttributes {
                first_name: row.get("first_name"),
                last_name: row.get("last_name"),
                email: row.get("email"),
                phone: row.get("phone"),
                linkedin_url: row.get("linkedin_url"),
                current_title: row.get("current_title"),
                current_company: row.get("current_company"),
                headline: row.get("headline"),
                bio: row.get("bio"),
                detailed_history: row.get("detailed_history"),
                cv_text: row.get("cv_text"),
                skills: row.get("skills"),
                employment_history: employment.0,
                education_history: education.0,
                ats_enhanced: row.get("ats_enhanced"),
            },
            field_sources: field_sources.0,
            lifecycle: lifecycle.parse()?,
            embedding_status: embedding_status.parse()?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn load_external_ids(
        &self,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, BTreeMap<CandidateSource, String>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(
            "SELECT candidate_id, source, external_id FROM candidate_external_id
             WHERE candidate_id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut map: HashMap<Uuid, BTreeMap<CandidateSource, String>> = HashMap::new();
        for row in rows {
            let source: String = row.get("source");
            map.entry(row.get("candidate_id"))
                .or_default()
                .insert(source.parse()?, row.get("external_id"));
        }
        Ok(map)
    }

    /// Parse rows and attach their external ids.
    async fn hydrate(&self, rows: Vec<PgRow>) -> Result<Vec<CanonicalCandidate>> {
        let mut candidates = rows
            .iter()
            .map(Self::parse_row)
            .collect::<Result<Vec<_>>>()?;
        let ids: Vec<Uuid> = candidates.iter().map(|c| c.id).collect();
        let mut external = self.load_external_ids(&ids).await?;
        for candidate in &mut candidates {
            if let Some(ids) = external.remove(&candidate.id) {
                candidate.external_ids = ids;
            }
        }
        Ok(candidates)
    }

    async fn fetch_one_hydrated(&self, row: Option<PgRow>) -> Result<Option<CanonicalCandidate>> {
        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.into_iter().next()),
            None => Ok(None),
        }
    }

    fn text(attrs: &CandidateAttributes, field: CandidateField) -> Option<String> {
        match attrs.field_value(field) {
            Some(FieldValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    /// Append `<column> = <value>` for one changed field.
    fn push_assignment(
        qb: &mut QueryBuilder<'_, Postgres>,
        field: CandidateField,
        attrs: &CandidateAttributes,
    ) {
        qb.push(field.as_str());
        qb.push(" = ");
        match field {
            CandidateField::Skills => qb.push_bind(attrs.skills.clone()),
            CandidateField::EmploymentHistory => {
                qb.push_bind(Json(attrs.employment_history.clone()))
            }
            CandidateField::EducationHistory => qb.push_bind(Json(attrs.education_history.clone())),
            CandidateField::AtsEnhanced => qb.push_bind(attrs.ats_enhanced),
            text_field => qb.push_bind(Self::text(attrs, text_field)),
        };
    }
}

#[async_trait]
impl CandidateRepository for PgCandidateRepository {
    async fn get(&self, id: Uuid) -> Result<Option<CanonicalCandidate>> {
        let row = sqlx::query(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM candidate WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        self.fetch_one_hydrated(row).await
    }

    async fn find_by_external_id(
        &self,
        source: CandidateSource,
        external_id: &str,
    ) -> Result<Option<CanonicalCandidate>> {
        let row = sqlx::query(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM candidate
             WHERE id = (
                 SELECT candidate_id FROM candidate_external_id
                 WHERE source = $1 AND external_id = $2
             )"
        ))
        .bind(source.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        self.fetch_one_hydrated(row).await
    }

    async fn find_active_by_email(&self, email: &str) -> Result<Vec<CanonicalCandidate>> {
        let rows = sqlx::query(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM candidate
             WHERE email = $1 AND lifecycle = 'active'
             ORDER BY created_at ASC"
        ))
        .bind(email)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        self.hydrate(rows).await
    }

    async fn find_active_by_linkedin_url(&self, url: &str) -> Result<Vec<CanonicalCandidate>> {
        let rows = sqlx::query(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM candidate
             WHERE linkedin_url = $1 AND lifecycle = 'active'
             ORDER BY created_at ASC"
        ))
        .bind(url)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        self.hydrate(rows).await
    }

    async fn insert(&self, candidate: &CanonicalCandidate) -> Result<()> {
        let attrs = &candidate.attributes;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query(&format!(
            "INSERT INTO candidate ({CANDIDATE_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                     $17, $18, $19, $20, $21, $22)"
        ))
        .bind(candidate.id)
        .bind(candidate.source.as_str())
        .bind(&attrs.first_name)
        .bind(&attrs.last_name)
        .bind(&attrs.email)
        .bind(&attrs.phone)
        .bind(&attrs.linkedin_url)
        .bind(&attrs.current_title)
        .bind(&attrs.current_company)
        .bind(&attrs.headline)
        .bind(&attrs.bio)
        .bind(&attrs.detailed_history)
        .bind(&attrs.cv_text)
        .bind(&attrs.skills)
        .bind(Json(&attrs.employment_history))
        .bind(Json(&attrs.education_history))
        .bind(attrs.ats_enhanced)
        .bind(Json(&candidate.field_sources))
        .bind(candidate.lifecycle.as_str())
        .bind(candidate.embedding_status.as_str())
        .bind(candidate.created_at)
        .bind(candidate.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(Error::from)?;

        for (source, external_id) in &candidate.external_ids {
            sqlx::query(
                "INSERT INTO candidate_external_id (candidate_id, source, external_id)
                 VALUES ($1, $2, $3)",
            )
            .bind(candidate.id)
            .bind(source.as_str())
            .bind(external_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::from)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn apply_patch(
        &self,
        id: Uuid,
        patch: &CandidatePatch,
        now: DateTime<Utc>,
    ) -> Result<CanonicalCandidate> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Row lock so concurrent fills see each other's writes.
        let row = sqlx::query(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM candidate WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .ok_or(Error::CandidateNotFound(id))?;

        let mut candidate = Self::parse_row(&row)?;
        let changed: BTreeSet<CandidateField> =
            candidate.apply_patch(patch, now).into_iter().collect();

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE candidate SET updated_at = ");
        qb.push_bind(now);
        for field in &changed {
            qb.push(", ");
            Self::push_assignment(&mut qb, *field, &candidate.attributes);
        }
        if !changed.is_empty() {
            qb.push(", field_sources = ");
            qb.push_bind(Json(candidate.field_sources.clone()));
        }
        qb.push(" WHERE id = ");
        qb.push_bind(id);
        qb.build()
            .execute(&mut *tx)
            .await
            .map_err(Error::from)?;

        if let Some((source, external_id)) = &patch.external_id {
            sqlx::query(
                "INSERT INTO candidate_external_id (candidate_id, source, external_id)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (candidate_id, source) DO NOTHING",
            )
            .bind(id)
            .bind(source.as_str())
            .bind(external_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::from)?;
        }

        tx.commit().await.map_err(Error::Database)?;

        candidate.external_ids = self
            .load_external_ids(&[id])
            .await?
            .remove(&id)
            .unwrap_or_default();
        Ok(candidate)
    }

    async fn set_embedding_status(&self, id: Uuid, status: EmbeddingStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE candidate SET embedding_status = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::CandidateNotFound(id));
        }
        Ok(())
    }

    async fn set_lifecycle(&self, id: Uuid, lifecycle: LifecycleStatus) -> Result<()> {
        let result =
            sqlx::query("UPDATE candidate SET lifecycle = $1, updated_at = $2 WHERE id = $3")
                .bind(lifecycle.as_str())
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(Error::from)?;

        if result.rows_affected() == 0 {
            return Err(Error::CandidateNotFound(id));
        }
        Ok(())
    }

    async fn list_active(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<CanonicalCandidate>> {
        let rows = sqlx::query(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM candidate
             WHERE lifecycle = 'active' AND ($1::uuid IS NULL OR id > $1)
             ORDER BY id ASC
             LIMIT $2"
        ))
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        self.hydrate(rows).await
    }

    async fn list_backfill_targets(
        &self,
        scope: BackfillScope,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<CanonicalCandidate>> {
        let rows = sqlx::query(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM candidate
             WHERE lifecycle = 'active'
               AND ($1::uuid IS NULL OR id > $1)
               AND ($2 OR first_name IS NULL OR last_name IS NULL OR email IS NULL
                    OR phone IS NULL OR linkedin_url IS NULL)
               AND EXISTS (
                   SELECT 1 FROM raw_ingest_record r WHERE r.candidate_id = candidate.id
               )
             ORDER BY id ASC
             LIMIT $3"
        ))
        .bind(after)
        .bind(scope == BackfillScope::All)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        self.hydrate(rows).await
    }

    async fn count_by_embedding_status(&self) -> Result<Vec<(EmbeddingStatus, i64)>> {
        let rows = sqlx::query(
            "SELECT embedding_status, COUNT(*) AS count FROM candidate
             GROUP BY embedding_status ORDER BY embedding_status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter()
            .map(|row| {
                let status: String = row.get("embedding_status");
                Ok((status.parse()?, row.get::<i64, _>("count")))
            })
            .collect()
    }
}
