//! Read side of the live job view: filtered pages, single jobs and the
//! option lists behind filter dropdowns.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use chrono::Utc;
use jobfeed_core::{JobProjection, RawJobRecord};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::debug;

use crate::{meta_keys, timestamp_text, JobStore, JOB_COLUMNS};

pub const DEFAULT_JOB_PAGE_SIZE: u32 = 20;
pub const MAX_JOB_PAGE_SIZE: u32 = 200;

/// Which taxonomy department filters and option lists use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepartmentSource {
    /// The feed's own department codes and labels.
    #[default]
    Api,
    /// The operator-maintained department number.
    Custom,
}

impl FromStr for DepartmentSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api" => Ok(DepartmentSource::Api),
            "custom" => Ok(DepartmentSource::Custom),
            other => Err(anyhow!("unknown department source {other:?} (expected api or custom)")),
        }
    }
}

impl DepartmentSource {
    /// Column a department filter value is matched against. With the api
    /// source numeric values are codes and anything else is a label.
    pub fn department_column(self, value: &str) -> &'static str {
        match self {
            DepartmentSource::Custom => "department_custom",
            DepartmentSource::Api if is_numeric(value) => "department_api_id",
            DepartmentSource::Api => "department_api",
        }
    }

    pub fn department_facet(self) -> FilterFacet {
        match self {
            DepartmentSource::Api => FilterFacet::DepartmentApiId,
            DepartmentSource::Custom => FilterFacet::DepartmentCustom,
        }
    }
}

fn is_numeric(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty() && value.parse::<f64>().is_ok()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQuery {
    /// Free text matched against the work site and the facility address.
    pub location: Option<String>,
    pub department: Option<String>,
    pub jobfamily: Option<String>,
    pub contract_type: Option<String>,
    pub facility_id: Option<String>,
    /// 1-based; 0 is treated as 1.
    pub page: u32,
    /// 0 selects [`DEFAULT_JOB_PAGE_SIZE`].
    pub page_size: u32,
}

impl JobQuery {
    pub fn page(&self) -> u32 {
        self.page.max(1)
    }

    pub fn page_size(&self) -> u32 {
        match self.page_size {
            0 => DEFAULT_JOB_PAGE_SIZE,
            n => n.min(MAX_JOB_PAGE_SIZE),
        }
    }

    fn push_filters(&self, builder: &mut QueryBuilder<'_, Sqlite>, source: DepartmentSource) {
        builder.push(" WHERE 1 = 1");
        if let Some(location) = non_blank(&self.location) {
            let pattern = like_pattern(location);
            builder
                .push(" AND (einsatzort LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR facility_address LIKE ")
                .push_bind(pattern)
                .push(" ESCAPE '\\')");
        }
        if let Some(department) = non_blank(&self.department) {
            builder
                .push(format!(" AND {} = ", source.department_column(department)))
                .push_bind(department.to_string());
        }
        for (column, value) in [
            ("jobfamily_id", &self.jobfamily),
            ("contract_type", &self.contract_type),
            ("facility_id", &self.facility_id),
        ] {
            if let Some(value) = non_blank(value) {
                builder
                    .push(format!(" AND {column} = "))
                    .push_bind(value.to_string());
            }
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn like_pattern(text: &str) -> String {
    let mut pattern = String::with_capacity(text.len() + 2);
    pattern.push('%');
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<JobProjection>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterFacet {
    DepartmentApiId,
    DepartmentApi,
    DepartmentCustom,
    Jobfamily,
    ContractType,
    Location,
}

impl FilterFacet {
    pub const ALL: [FilterFacet; 6] = [
        FilterFacet::DepartmentApiId,
        FilterFacet::DepartmentApi,
        FilterFacet::DepartmentCustom,
        FilterFacet::Jobfamily,
        FilterFacet::ContractType,
        FilterFacet::Location,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FilterFacet::DepartmentApiId => "department_api_id",
            FilterFacet::DepartmentApi => "department_api",
            FilterFacet::DepartmentCustom => "department_custom",
            FilterFacet::Jobfamily => "jobfamily",
            FilterFacet::ContractType => "contract_type",
            FilterFacet::Location => "location",
        }
    }

    fn cache_key(self) -> String {
        format!("{}{}", meta_keys::FILTER_CACHE_PREFIX, self.as_str())
    }

    /// `(value, label)` query for facets that map onto columns directly.
    fn option_sql(self) -> Option<&'static str> {
        match self {
            FilterFacet::DepartmentApiId => Some(
                "SELECT department_api_id AS value, MIN(department_api) AS label FROM jobs_current \
                 WHERE department_api_id <> '' GROUP BY department_api_id ORDER BY label, value",
            ),
            FilterFacet::DepartmentApi => Some(
                "SELECT department_api AS value, department_api AS label FROM jobs_current \
                 WHERE department_api <> '' GROUP BY department_api ORDER BY value",
            ),
            FilterFacet::DepartmentCustom => Some(
                "SELECT department_custom AS value, department_custom AS label FROM jobs_current \
                 WHERE department_custom <> '' GROUP BY department_custom ORDER BY value",
            ),
            FilterFacet::Jobfamily => Some(
                "SELECT jobfamily_id AS value, MIN(jobfamily_name) AS label FROM jobs_current \
                 WHERE jobfamily_id <> '' GROUP BY jobfamily_id ORDER BY label, value",
            ),
            FilterFacet::ContractType => Some(
                "SELECT contract_type AS value, contract_type AS label FROM jobs_current \
                 WHERE contract_type <> '' GROUP BY contract_type ORDER BY value",
            ),
            FilterFacet::Location => None,
        }
    }
}

impl fmt::Display for FilterFacet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterFacet {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FilterFacet::ALL
            .into_iter()
            .find(|facet| facet.as_str() == s)
            .ok_or_else(|| anyhow!("unknown filter facet {s:?}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOption {
    pub value: String,
    pub label: String,
}

pub(crate) fn projection_from_row(row: &SqliteRow) -> anyhow::Result<JobProjection> {
    let raw_json: String = row.try_get("raw_json")?;
    let raw: RawJobRecord = serde_json::from_str(&raw_json).context("decoding stored raw record")?;
    Ok(JobProjection {
        job_id: row.try_get("job_id")?,
        facility_id: row.try_get("facility_id")?,
        facility_name: row.try_get("facility_name")?,
        facility_address: row.try_get("facility_address")?,
        plz_einsatzort: row.try_get("plz_einsatzort")?,
        strasse_einsatzort: row.try_get("strasse_einsatzort")?,
        einsatzort: row.try_get("einsatzort")?,
        department_api: row.try_get("department_api")?,
        department_api_id: row.try_get("department_api_id")?,
        department_custom: row.try_get("department_custom")?,
        jobfamily_id: row.try_get("jobfamily_id")?,
        jobfamily_name: row.try_get("jobfamily_name")?,
        contract_type: row.try_get("contract_type")?,
        employment_type: row.try_get("employment_type")?,
        work_time_model: row.try_get("work_time_model")?,
        is_minijob: row.try_get("is_minijob")?,
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
        published_at: row.try_get("published_at")?,
        expires_at: row.try_get("expires_at")?,
        last_seen_run_id: row.try_get("last_seen_run_id")?,
        raw,
    })
}

/// City part of `"street, 12345 City"`; the whole address when no postal code is found.
fn city_from_address(address: &str) -> &str {
    let bytes = address.as_bytes();
    for (i, _) in address.char_indices() {
        let rest = &bytes[i..];
        let starts_word = i == 0 || !bytes[i - 1].is_ascii_alphanumeric();
        if starts_word
            && rest.len() > 6
            && rest[..5].iter().all(u8::is_ascii_digit)
            && rest[5].is_ascii_whitespace()
        {
            let city = address[i + 5..].trim();
            if !city.is_empty() {
                return city;
            }
        }
    }
    address.trim()
}

impl JobStore {
    /// One page of the live view, ordered by facility name, then job family.
    pub async fn query_jobs(&self, query: &JobQuery, source: DepartmentSource) -> anyhow::Result<JobPage> {
        let page = query.page();
        let page_size = query.page_size();

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM jobs_current");
        query.push_filters(&mut count, source);
        let total: i64 = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .context("counting jobs")?;

        let mut select = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM jobs_current", JOB_COLUMNS.join(", ")));
        query.push_filters(&mut select, source);
        select
            .push(" ORDER BY facility_name, jobfamily_name, job_id LIMIT ")
            .push_bind(i64::from(page_size))
            .push(" OFFSET ")
            .push_bind(i64::from(page - 1) * i64::from(page_size));
        let rows = select.build().fetch_all(&self.pool).await.context("listing jobs")?;
        let jobs = rows.iter().map(projection_from_row).collect::<anyhow::Result<Vec<_>>>()?;

        Ok(JobPage {
            jobs,
            total,
            page,
            page_size,
        })
    }

    pub async fn job_by_id(&self, job_id: &str) -> anyhow::Result<Option<JobProjection>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs_current WHERE job_id = ?1", JOB_COLUMNS.join(", ")))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading job {job_id}"))?;
        row.as_ref().map(projection_from_row).transpose()
    }

    /// Distinct values of `facet` in the live view, served from the cache
    /// when present. The cache is dropped by every publish, import and reset;
    /// a list computed before such a drop is returned but not cached.
    pub async fn filter_options(&self, facet: FilterFacet) -> anyhow::Result<Vec<FilterOption>> {
        let key = facet.cache_key();
        let generation = self.meta(meta_keys::FILTER_GENERATION).await?.unwrap_or_default();
        if let Some(cached) = self.meta_json::<Vec<FilterOption>>(&key).await? {
            return Ok(cached);
        }

        let options = match facet.option_sql() {
            Some(sql) => {
                let rows = sqlx::query(sql)
                    .fetch_all(&self.pool)
                    .await
                    .with_context(|| format!("loading {facet} options"))?;
                rows.iter()
                    .map(|row| {
                        let value: String = row.try_get("value")?;
                        let label: Option<String> = row.try_get("label")?;
                        let label = label.filter(|l| !l.is_empty()).unwrap_or_else(|| value.clone());
                        Ok(FilterOption { value, label })
                    })
                    .collect::<anyhow::Result<Vec<_>>>()?
            }
            None => self.location_options().await?,
        };

        let cached = self.cache_filter_options(&key, &options, &generation).await?;
        debug!(%facet, count = options.len(), cached, "filter options rebuilt");
        Ok(options)
    }

    /// Stores `options` under `key` only while the cache generation is still
    /// `generation`. Returns whether the entry was written.
    pub(crate) async fn cache_filter_options(
        &self,
        key: &str,
        options: &[FilterOption],
        generation: &str,
    ) -> anyhow::Result<bool> {
        let text = serde_json::to_string(options).with_context(|| format!("encoding meta key {key}"))?;
        let result = sqlx::query(
            r#"
            INSERT INTO sync_meta (key, value, updated_at)
            SELECT ?1, ?2, ?3
            WHERE COALESCE((SELECT value FROM sync_meta WHERE key = ?4), '') = ?5
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(text)
        .bind(timestamp_text(Utc::now()))
        .bind(meta_keys::FILTER_GENERATION)
        .bind(generation)
        .execute(&self.pool)
        .await
        .with_context(|| format!("writing meta key {key}"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn location_options(&self) -> anyhow::Result<Vec<FilterOption>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT facility_address, einsatzort FROM jobs_current WHERE facility_address <> '' OR einsatzort <> ''",
        )
        .fetch_all(&self.pool)
        .await
        .context("loading location options")?;

        let mut places = BTreeSet::new();
        for (address, worksite) in &rows {
            let city = city_from_address(address);
            if !city.is_empty() {
                places.insert(city.to_string());
            }
            places.extend(
                worksite
                    .split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(str::to_string),
            );
        }
        Ok(places
            .into_iter()
            .map(|place| FilterOption {
                value: place.clone(),
                label: place,
            })
            .collect())
    }
}
