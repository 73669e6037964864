//! SOAP client for the platform's document-generation service.
//!
//! The request envelope is a fixed legacy schema: a WS-Security header
//! carrying plaintext credentials and a five-minute validity window, and a
//! body naming the four keys of one retrieval. Only the keys and the
//! timestamps vary between calls; namespaces and element order must match
//! the service's expected schema exactly.

use crate::config::ServiceSettings;
use crate::error::{ExtractError, ExtractResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use cdex_types::{DocumentSeriesKey, OrderKey, PatientKey, ProviderKey};
use chrono::{SecondsFormat, Utc};
use reqwest::header::CONTENT_TYPE;

/// How long the credentials in one request envelope stay valid.
const CREDENTIAL_VALIDITY_MINUTES: i64 = 5;

const CONTENT_TYPE_XML: &str = "text/xml; charset=utf-8";

/// Element carrying the base64-encoded document in the service reply.
const PAYLOAD_ELEMENT: &str = "transitionOfCareAsXML";

/// Client for the remote document-generation service.
pub struct DocumentClient {
    http: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
}

impl DocumentClient {
    /// Builds a client for the configured service.
    ///
    /// # Errors
    ///
    /// Fails only if the underlying HTTP client cannot be constructed.
    pub fn new(settings: &ServiceSettings) -> ExtractResult<Self> {
        let mut builder = reqwest::Client::builder();
        if settings.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            http: builder.build()?,
            endpoint: settings.endpoint(),
            username: settings.username.clone(),
            password: settings.password.clone(),
        })
    }

    /// Builds a client against an explicit endpoint URL, bypassing the
    /// conventional `https://host:port/<database>/ws/Services/emr` shape.
    /// Useful when the service sits behind a rewriting gateway, and in
    /// tests.
    pub fn with_endpoint(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Retrieves one document and returns its decoded bytes.
    ///
    /// Any transport failure, non-success status, malformed reply or
    /// malformed payload encoding is terminal for the call; no partial
    /// bytes are ever returned.
    pub async fn fetch_document(
        &self,
        order_id: OrderKey,
        pid: PatientKey,
        sdid: DocumentSeriesKey,
        pvid: ProviderKey,
    ) -> ExtractResult<Vec<u8>> {
        let envelope = self.request_envelope(order_id, pid, sdid, pvid);

        let response = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, CONTENT_TYPE_XML)
            .body(envelope)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractError::Protocol(format!(
                "service returned status {status}"
            )));
        }

        let body = response.text().await?;
        decode_document(&body)
    }

    /// Renders the request envelope for one retrieval.
    ///
    /// Everything except the four keys, the credentials and the
    /// Created/Expires pair is invariant.
    fn request_envelope(
        &self,
        order_id: OrderKey,
        pid: PatientKey,
        sdid: DocumentSeriesKey,
        pvid: ProviderKey,
    ) -> String {
        let created = Utc::now();
        let expires = created + chrono::Duration::minutes(CREDENTIAL_VALIDITY_MINUTES);

        format!(
            r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" xmlns:u="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd">
	<s:Header>
		<o:Security s:mustUnderstand="1" xmlns:o="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd">
			<u:Timestamp u:Id="_0">
				<u:Created>{created}</u:Created>
				<u:Expires>{expires}</u:Expires>
			</u:Timestamp>
			<o:UsernameToken u:Id="uuid-7ba6d9c2-0f63-4f2e-9d1c-4a5e8b21c703-1">
				<o:Username>{username}</o:Username>
				<o:Password Type="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordText">{password}</o:Password>
			</o:UsernameToken>
		</o:Security>
	</s:Header>
	<s:Body xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:xsd="http://www.w3.org/2001/XMLSchema">
		<GetTransitionOfCareCcda xmlns="http://emr.ws.cp.gehcit.com/">
			<patientId>{pid}</patientId>
			<documentId>{sdid}</documentId>
			<providerId>{pvid}</providerId>
			<orderId>{order_id}</orderId>
		</GetTransitionOfCareCcda>
	</s:Body>
</s:Envelope>"#,
            created = created.to_rfc3339_opts(SecondsFormat::Secs, true),
            expires = expires.to_rfc3339_opts(SecondsFormat::Secs, true),
            username = xml_escape(&self.username),
            password = xml_escape(&self.password),
        )
    }
}

#[async_trait::async_trait]
impl crate::extract::DocumentSource for DocumentClient {
    async fn fetch_document(
        &self,
        order_id: OrderKey,
        pid: PatientKey,
        sdid: DocumentSeriesKey,
        pvid: ProviderKey,
    ) -> ExtractResult<Vec<u8>> {
        DocumentClient::fetch_document(self, order_id, pid, sdid, pvid).await
    }
}

/// Extracts and decodes the document payload from a service reply.
///
/// The payload sits nested under the envelope body:
/// `Body > GetTransitionOfCareCcdaResponse > return > transitionOfCareAsXML`,
/// base64-encoded.
fn decode_document(body: &str) -> ExtractResult<Vec<u8>> {
    let doc = roxmltree::Document::parse(body)
        .map_err(|e| ExtractError::Protocol(format!("unparseable response: {e}")))?;

    let envelope_body = doc
        .descendants()
        .find(|node| node.tag_name().name() == "Body")
        .ok_or_else(|| ExtractError::Protocol("response has no envelope body".to_string()))?;

    let payload = envelope_body
        .descendants()
        .find(|node| node.tag_name().name() == PAYLOAD_ELEMENT)
        .ok_or_else(|| {
            ExtractError::Protocol(format!("response carries no {PAYLOAD_ELEMENT} element"))
        })?;

    let text = payload.text().unwrap_or_default().trim();
    Ok(BASE64.decode(text)?)
}

/// Escapes text content for embedding in the envelope.
fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with_payload(payload: &str) -> String {
        format!(
            r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
	<soap:Body>
		<ns2:GetTransitionOfCareCcdaResponse xmlns:ns2="http://emr.ws.cp.gehcit.com/">
			<return>
				<transitionOfCareAsXML>{payload}</transitionOfCareAsXML>
			</return>
		</ns2:GetTransitionOfCareCcdaResponse>
	</soap:Body>
</soap:Envelope>"#
        )
    }

    #[test]
    fn test_decode_document_round_trip() {
        let body = response_with_payload("PGEvPg==");
        assert_eq!(decode_document(&body).unwrap(), b"<a/>");
    }

    #[test]
    fn test_decode_document_rejects_malformed_base64() {
        let body = response_with_payload("not-base64!");
        assert!(matches!(
            decode_document(&body),
            Err(ExtractError::PayloadDecode(_))
        ));
    }

    #[test]
    fn test_decode_document_rejects_missing_payload_element() {
        let body = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
	<soap:Body><wrong/></soap:Body>
</soap:Envelope>"#;
        assert!(matches!(
            decode_document(body),
            Err(ExtractError::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_document_rejects_unparseable_xml() {
        assert!(matches!(
            decode_document("<<not xml"),
            Err(ExtractError::Protocol(_))
        ));
    }

    #[test]
    fn test_request_envelope_carries_keys_and_window() {
        let client = DocumentClient::with_endpoint("https://emr:9443/x", "alice", "s&cret");
        let envelope = client.request_envelope(900, 100, 5, 7);

        assert!(envelope.contains("<patientId>100</patientId>"));
        assert!(envelope.contains("<documentId>5</documentId>"));
        assert!(envelope.contains("<providerId>7</providerId>"));
        assert!(envelope.contains("<orderId>900</orderId>"));
        assert!(envelope.contains("<o:Username>alice</o:Username>"));
        // Credentials are escaped for XML text content.
        assert!(envelope.contains("s&amp;cret"));
        assert!(envelope.contains("<u:Created>"));
        assert!(envelope.contains("<u:Expires>"));
        // Timestamps end in the wire format's trailing Z.
        assert!(envelope.contains("Z</u:Created>"));
        assert!(envelope.contains("Z</u:Expires>"));
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape("a<b>&'\""), "a&lt;b&gt;&amp;&apos;&quot;");
        assert_eq!(xml_escape("plain"), "plain");
    }
}
