//! Durable, row-scoped, per-user task store. Implemented as a REST client
//! against a PostgREST-style endpoint; every call carries the caller's
//! access token as the authorization header, which the backing database
//! enforces as row-level security. This crate never validates the token.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use crate::domain::{TaskRecord, TaskUpdate};
use crate::error::SubstrateError;
use crate::Result;

use super::DurableStore;

pub struct RestDurableStore {
    client: Client,
    base_url: String,
}

impl RestDurableStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    fn tasks_url(&self) -> String {
        format!("{}/tasks", self.base_url.trim_end_matches('/'))
    }

    fn task_url(&self, correlation_id: &str) -> String {
        format!("{}/{correlation_id}", self.tasks_url())
    }
}

#[async_trait]
impl DurableStore for RestDurableStore {
    async fn create_task(
        &self,
        record: &TaskRecord,
        user_id: &str,
        access_token: &str,
    ) -> Result<()> {
        let response = self
            .client
            .post(self.tasks_url())
            .bearer_auth(access_token)
            .json(&record)
            .send()
            .await
            .map_err(|e| SubstrateError::DurableStoreUnavailable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            // Collision on correlation_id is treated as an update, matching
            // the idempotent-create requirement.
            StatusCode::CONFLICT => {
                self.update_task(
                    &record.correlation_id,
                    &TaskUpdate {
                        status: Some(record.status),
                        mandate: Some(record.mandate.clone()),
                        tick: record.tick,
                        max_ticks: Some(record.max_ticks),
                        result: record.result.clone(),
                        error: record.error.clone(),
                    },
                    user_id,
                    access_token,
                )
                .await
            }
            status => Err(SubstrateError::DurableStoreUnavailable(format!(
                "create_task failed with status {status}"
            ))),
        }
    }

    async fn get_task(
        &self,
        correlation_id: &str,
        _user_id: &str,
        access_token: &str,
    ) -> Result<Option<TaskRecord>> {
        let response = self
            .client
            .get(self.task_url(correlation_id))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| SubstrateError::DurableStoreUnavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let record = response
                    .json::<TaskRecord>()
                    .await
                    .map_err(|e| SubstrateError::DurableStoreUnavailable(e.to_string()))?;
                Ok(Some(record))
            }
            status => Err(SubstrateError::DurableStoreUnavailable(format!(
                "get_task failed with status {status}"
            ))),
        }
    }

    async fn update_task(
        &self,
        correlation_id: &str,
        partial: &TaskUpdate,
        _user_id: &str,
        access_token: &str,
    ) -> Result<()> {
        let response = self
            .client
            .patch(self.task_url(correlation_id))
            .bearer_auth(access_token)
            .json(partial)
            .send()
            .await
            .map_err(|e| SubstrateError::DurableStoreUnavailable(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(SubstrateError::DurableStoreUnavailable(format!(
                "update_task failed with status {}",
                response.status()
            )))
        }
    }

    async fn list_tasks(&self, _user_id: &str, access_token: &str) -> Result<Vec<TaskRecord>> {
        let response = self
            .client
            .get(self.tasks_url())
            .query(&[("order", "updated_at.desc")])
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| SubstrateError::DurableStoreUnavailable(e.to_string()))?;

        if response.status().is_success() {
            response
                .json::<Vec<TaskRecord>>()
                .await
                .map_err(|e| SubstrateError::DurableStoreUnavailable(e.to_string()))
        } else {
            Err(SubstrateError::DurableStoreUnavailable(format!(
                "list_tasks failed with status {}",
                response.status()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> TaskRecord {
        TaskRecord::new("c1".into(), Some("user-1".into()), "do the thing".into(), 10)
    }

    #[tokio::test]
    async fn get_task_returns_none_on_404() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/tasks/c1")
            .with_status(404)
            .create_async()
            .await;

        let store = RestDurableStore::new(server.url());
        let result = store.get_task("c1", "user-1", "token").await.unwrap();
        assert!(result.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn get_task_deserializes_a_successful_response() {
        let mut server = mockito::Server::new_async().await;
        let record = sample_record();
        let body = serde_json::to_string(&record).unwrap();
        let mock = server
            .mock("GET", "/tasks/c1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await;

        let store = RestDurableStore::new(server.url());
        let result = store.get_task("c1", "user-1", "token").await.unwrap();
        assert_eq!(result.unwrap().correlation_id, "c1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn create_task_falls_back_to_update_on_conflict() {
        let mut server = mockito::Server::new_async().await;
        let create_mock = server
            .mock("POST", "/tasks")
            .with_status(409)
            .create_async()
            .await;
        let update_mock = server
            .mock("PATCH", "/tasks/c1")
            .with_status(200)
            .create_async()
            .await;

        let store = RestDurableStore::new(server.url());
        store
            .create_task(&sample_record(), "user-1", "token")
            .await
            .unwrap();

        create_mock.assert_async().await;
        update_mock.assert_async().await;
    }

    #[tokio::test]
    async fn list_tasks_errors_on_server_failure() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", mockito::Matcher::Regex("/tasks.*".into()))
            .with_status(500)
            .create_async()
            .await;

        let store = RestDurableStore::new(server.url());
        let result = store.list_tasks("user-1", "token").await;
        assert!(result.is_err());
        mock.assert_async().await;
    }
}
