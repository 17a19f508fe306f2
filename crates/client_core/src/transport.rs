use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Procedure, ProcedureId},
    error::ApiError,
    protocol::{
        CommandEnvelope, ProcedureDraft, ProcedureListResponse, SelectPortRequest,
        SerialPortListResponse, SetTemperatureRequest,
    },
};
use tracing::debug;
use url::Url;

use crate::error::TransportError;

/// Every command the engine can issue. Implementations return strict domain
/// values; loose wire payloads never cross this boundary.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn list_procedures(&self) -> Result<Vec<Procedure>, TransportError>;
    async fn create_procedure(&self, draft: &ProcedureDraft) -> Result<Procedure, TransportError>;
    async fn update_procedure(
        &self,
        id: &ProcedureId,
        draft: &ProcedureDraft,
    ) -> Result<Procedure, TransportError>;
    async fn delete_procedure(&self, id: &ProcedureId) -> Result<(), TransportError>;
    async fn start_procedure(&self, id: &ProcedureId) -> Result<Procedure, TransportError>;
    /// Stops whatever is running; the backend runs at most one procedure.
    async fn stop_procedure(&self) -> Result<Procedure, TransportError>;
    async fn reset_procedure(&self, id: &ProcedureId) -> Result<Procedure, TransportError>;
    async fn list_ports(&self) -> Result<Vec<String>, TransportError>;
    async fn select_port(&self, port: &str) -> Result<(), TransportError>;
    async fn set_temperature(&self, celsius: f64) -> Result<(), TransportError>;
}

pub struct HttpCommandTransport {
    http: Client,
    base_url: Url,
}

impl HttpCommandTransport {
    pub fn new(base_url: Url, request_timeout: Duration) -> Result<Self, TransportError> {
        if base_url.cannot_be_a_base() {
            return Err(TransportError::InvalidUrl(base_url.to_string()));
        }
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post_command(&self, segments: &[&str]) -> Result<Procedure, TransportError> {
        let url = self.endpoint(segments)?;
        debug!(%url, "http: POST");
        let response = self.http.post(url).send().await?;
        procedure_from_envelope(response).await
    }
}

#[async_trait]
impl CommandTransport for HttpCommandTransport {
    async fn list_procedures(&self) -> Result<Vec<Procedure>, TransportError> {
        let url = self.endpoint(&["procedures"])?;
        debug!(%url, "http: GET");
        let response = self.http.get(url).send().await?;
        let body: ProcedureListResponse = read_json(response).await?;
        body.procedures
            .into_iter()
            .map(|record| Procedure::try_from(record).map_err(TransportError::InvalidPayload))
            .collect()
    }

    async fn create_procedure(&self, draft: &ProcedureDraft) -> Result<Procedure, TransportError> {
        let url = self.endpoint(&["procedures"])?;
        debug!(%url, name = %draft.name, "http: POST");
        let response = self.http.post(url).json(draft).send().await?;
        procedure_from_envelope(response).await
    }

    async fn update_procedure(
        &self,
        id: &ProcedureId,
        draft: &ProcedureDraft,
    ) -> Result<Procedure, TransportError> {
        let url = self.endpoint(&["procedures", id.as_str()])?;
        debug!(%url, "http: PUT");
        let response = self.http.put(url).json(draft).send().await?;
        procedure_from_envelope(response).await
    }

    async fn delete_procedure(&self, id: &ProcedureId) -> Result<(), TransportError> {
        let url = self.endpoint(&["procedures", id.as_str()])?;
        debug!(%url, "http: DELETE");
        let response = self.http.delete(url).send().await?;
        let envelope: CommandEnvelope = read_json(response).await?;
        accept_envelope(envelope).map(|_| ())
    }

    async fn start_procedure(&self, id: &ProcedureId) -> Result<Procedure, TransportError> {
        self.post_command(&["procedures", id.as_str(), "start"]).await
    }

    async fn stop_procedure(&self) -> Result<Procedure, TransportError> {
        self.post_command(&["procedures", "stop"]).await
    }

    async fn reset_procedure(&self, id: &ProcedureId) -> Result<Procedure, TransportError> {
        self.post_command(&["procedures", id.as_str(), "reset"]).await
    }

    async fn list_ports(&self) -> Result<Vec<String>, TransportError> {
        let url = self.endpoint(&["serial-ports"])?;
        debug!(%url, "http: GET");
        let response = self.http.get(url).send().await?;
        let body: SerialPortListResponse = read_json(response).await?;
        Ok(body.ports)
    }

    async fn select_port(&self, port: &str) -> Result<(), TransportError> {
        let url = self.endpoint(&["serial-port", "select"])?;
        debug!(%url, port, "http: POST");
        let response = self
            .http
            .post(url)
            .json(&SelectPortRequest {
                port: port.to_string(),
            })
            .send()
            .await?;
        ensure_success(response).await.map(|_| ())
    }

    async fn set_temperature(&self, celsius: f64) -> Result<(), TransportError> {
        let url = self.endpoint(&["set-temperature"])?;
        debug!(%url, celsius, "http: POST");
        let response = self
            .http
            .post(url)
            .json(&SetTemperatureRequest {
                temperature: celsius,
            })
            .send()
            .await?;
        ensure_success(response).await.map(|_| ())
    }
}

/// Reads the body and maps a non-2xx status to [`TransportError::Status`].
async fn ensure_success(response: Response) -> Result<Vec<u8>, TransportError> {
    let status = response.status();
    let body = response.bytes().await?;
    if !status.is_success() {
        let text = String::from_utf8_lossy(&body);
        return Err(TransportError::Status {
            status: status.as_u16(),
            error: ApiError::from_response(status.as_u16(), &text),
        });
    }
    Ok(body.to_vec())
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, TransportError> {
    let body = ensure_success(response).await?;
    serde_json::from_slice(&body).map_err(|err| TransportError::Malformed(err.to_string()))
}

async fn procedure_from_envelope(response: Response) -> Result<Procedure, TransportError> {
    let envelope: CommandEnvelope = read_json(response).await?;
    let record = accept_envelope(envelope)?
        .procedure
        .ok_or(TransportError::MissingProcedure)?;
    Procedure::try_from(record).map_err(TransportError::InvalidPayload)
}

fn accept_envelope(envelope: CommandEnvelope) -> Result<CommandEnvelope, TransportError> {
    if !envelope.success {
        return Err(TransportError::Rejected {
            message: envelope.message,
        });
    }
    Ok(envelope)
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
