// src/progress.rs
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

use crate::config::ProgressStoreConfig;
use crate::errors::{Result, RunnerError};

/// Whole-number completion percentage, rounded half up. Zero sections means 0%.
pub fn completion_percentage(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let completed = completed.min(total);
    ((completed * 200 + total) / (total * 2)) as u8
}

/// One expected-output check of a coding exercise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub input: String,
    pub expected: String,
}

/// Pass/fail per case: a case passes when the run output contains its
/// expected text.
pub fn check_test_cases(output: &str, cases: &[TestCase]) -> Vec<bool> {
    cases.iter().map(|case| output.contains(&case.expected)).collect()
}

/// Row of the `section_progress` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionProgress {
    pub user_id: String,
    pub course_code: String,
    pub section_id: String,
    pub is_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Row of the `course_progress` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseProgress {
    pub user_id: String,
    pub course_code: String,
    pub last_section_id: String,
    pub progress_percentage: u8,
    pub is_completed: bool,
    pub last_accessed_at: DateTime<Utc>,
}

/// Client for the hosted backend's REST tables that hold course progress.
pub struct ProgressStore {
    client: Client,
    config: ProgressStoreConfig,
    access_token: Option<String>,
}

impl ProgressStore {
    pub fn new(client: Client, config: ProgressStoreConfig) -> Self {
        Self {
            client,
            config,
            access_token: None,
        }
    }

    /// Acts on behalf of a signed-in user instead of the anonymous role.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.api_base, table)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.config.anon_key);
        builder
            .header("apikey", &self.config.anon_key)
            .header("Authorization", format!("Bearer {}", bearer))
    }

    async fn upsert<T: Serialize>(&self, table: &str, conflict_columns: &str, row: &T) -> Result<()> {
        let url = format!("{}?on_conflict={}", self.table_url(table), conflict_columns);
        let resp = self
            .authorized(self.client.post(&url))
            .header("Content-Type", "application/json")
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(row)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let error_body = resp
                .text()
                .await
                .unwrap_or_else(|_| "Could not read error body".to_string());
            return Err(RunnerError::ApiError {
                status: status.as_u16(),
                body: error_body,
            });
        }
        Ok(())
    }

    pub async fn upsert_section(&self, row: &SectionProgress) -> Result<()> {
        log::info!(
            "Saving section progress {}/{} for user {}",
            row.course_code,
            row.section_id,
            row.user_id
        );
        self.upsert("section_progress", "user_id,course_code,section_id", row).await
    }

    pub async fn upsert_course(&self, row: &CourseProgress) -> Result<()> {
        log::info!(
            "Saving course progress {} at {}% for user {}",
            row.course_code,
            row.progress_percentage,
            row.user_id
        );
        self.upsert("course_progress", "user_id,course_code", row).await
    }

    /// Completed sections of one course for one user.
    pub async fn completed_sections(&self, user_id: &str, course_code: &str) -> Result<Vec<SectionProgress>> {
        let user_filter = format!("eq.{}", user_id);
        let course_filter = format!("eq.{}", course_code);
        let resp = self
            .authorized(self.client.get(self.table_url("section_progress")))
            .query(&[
                ("select", "*"),
                ("user_id", user_filter.as_str()),
                ("course_code", course_filter.as_str()),
                ("is_completed", "eq.true"),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let error_body = resp
                .text()
                .await
                .unwrap_or_else(|_| "Could not read error body".to_string());
            return Err(RunnerError::ApiError {
                status: status.as_u16(),
                body: error_body,
            });
        }
        Ok(resp.json().await?)
    }

    /// Marks a section done and refreshes the course row from the new count.
    /// Returns the course's completion percentage.
    pub async fn record_section_completed(
        &self,
        user_id: &str,
        course_code: &str,
        section_id: &str,
        total_sections: usize,
    ) -> Result<u8> {
        let now = Utc::now();
        self.upsert_section(&SectionProgress {
            user_id: user_id.to_string(),
            course_code: course_code.to_string(),
            section_id: section_id.to_string(),
            is_completed: true,
            completed_at: Some(now),
        })
        .await?;

        let completed = self.completed_sections(user_id, course_code).await?.len();
        let percentage = completion_percentage(completed, total_sections);

        self.upsert_course(&CourseProgress {
            user_id: user_id.to_string(),
            course_code: course_code.to_string(),
            last_section_id: section_id.to_string(),
            progress_percentage: percentage,
            is_completed: percentage == 100,
            last_accessed_at: now,
        })
        .await?;

        Ok(percentage)
    }

    /// Records a coding exercise as done when every test case passes against
    /// the run output. Returns the new course percentage, or `None` when a
    /// case failed and nothing was saved.
    pub async fn record_exercise(
        &self,
        user_id: &str,
        course_code: &str,
        section_id: &str,
        total_sections: usize,
        output: &str,
        cases: &[TestCase],
    ) -> Result<Option<u8>> {
        let results = check_test_cases(output, cases);
        let passed = results.iter().filter(|ok| **ok).count();
        if passed < results.len() {
            log::info!(
                "Exercise {} passed {}/{} test cases; not marking complete",
                section_id,
                passed,
                results.len()
            );
            return Ok(None);
        }

        let percentage = self
            .record_section_completed(user_id, course_code, section_id, total_sections)
            .await?;
        Ok(Some(percentage))
    }
}
