use std::collections::BTreeMap;
use std::io::Cursor;

use data_encoding::BASE64;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer as XmlWriter};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const SOAP_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const CONTAINER_FORMAT: &str = "BDOC";
const CONTAINER_VERSION: &str = "2.1";
const DIGEST_TYPE: &str = "sha256";

/// A signing session on the RPC gateway. The gateway keys all per-session
/// state on this code; we carry it as plain data so a session can cross
/// requests without any client-side mutable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkiSession {
    pub sesscode: i64,
}

/// A signature prepared on the gateway, waiting for the voter's smartcard
/// to sign `digest_to_sign` locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedSignature {
    pub signature_id: String,
    pub digest_to_sign: String,
}

/// Client for the SOAP-like signing gateway (smartcard/PKI and
/// phone-challenge flows share this endpoint).
///
/// Gateway faults are surfaced as [`Error::RemoteFault`]; only transport
/// failures ([`Error::Transport`]) are safe to retry.
pub struct RpcClient {
    http: reqwest::Client,
    endpoint: String,
    service_name: String,
}

impl RpcClient {
    pub fn new(http: reqwest::Client, endpoint: String, service_name: String) -> Self {
        Self {
            http,
            endpoint,
            service_name,
        }
    }

    /// The service name we identify ourselves with on every call.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Perform one RPC round trip: build the envelope, POST it, flatten the
    /// response into leaf-element text and classify faults.
    pub(crate) async fn call(
        &self,
        action: &str,
        params: &[(&str, String)],
    ) -> Result<BTreeMap<String, String>> {
        let envelope = build_envelope(action, params);
        trace!("rpc {action} -> {}", self.endpoint);
        let response = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", format!("\"{action}\""))
            .body(envelope)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        let fields = parse_response(&body)?;
        check_fault(&fields)?;
        if !status.is_success() {
            return Err(Error::RemoteFault {
                code: status.as_u16().to_string(),
                message: format!("unexpected gateway response to {action}"),
            });
        }
        Ok(fields)
    }

    /// `StartSession`: open a held session and return its handle.
    pub async fn start_session(&self) -> Result<PkiSession> {
        let fields = self
            .call("StartSession", &[("bHoldSession", "true".to_string())])
            .await?;
        let sesscode = field(&fields, "Sesscode")?
            .parse::<i64>()
            .map_err(|_| malformed("Sesscode is not numeric"))?;
        Ok(PkiSession { sesscode })
    }

    /// `CheckCertificate`: verify the signer certificate is usable.
    pub async fn check_certificate(&self, certificate_b64: &str) -> Result<()> {
        let fields = self
            .call(
                "CheckCertificate",
                &[("Certificate", certificate_b64.to_string())],
            )
            .await?;
        match field(&fields, "Status")?.as_str() {
            "GOOD" | "OK" => Ok(()),
            other => Err(Error::RemoteFault {
                code: other.to_string(),
                message: "certificate rejected by gateway".to_string(),
            }),
        }
    }

    /// `CreateSignedDoc`: start an empty container in the session.
    pub async fn create_signed_doc(&self, session: &PkiSession) -> Result<()> {
        self.call(
            "CreateSignedDoc",
            &[
                ("Sesscode", session.sesscode.to_string()),
                ("Format", CONTAINER_FORMAT.to_string()),
                ("Version", CONTAINER_VERSION.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    /// `AddDataFile` in inline-base64 content mode.
    pub async fn add_data_file_content(
        &self,
        session: &PkiSession,
        file_name: &str,
        mime_type: &str,
        content: &[u8],
    ) -> Result<()> {
        self.call(
            "AddDataFile",
            &[
                ("Sesscode", session.sesscode.to_string()),
                ("FileName", file_name.to_string()),
                ("MimeType", mime_type.to_string()),
                ("ContentType", "EMBEDDED_BASE64".to_string()),
                ("Size", content.len().to_string()),
                ("Content", BASE64.encode(content)),
            ],
        )
        .await?;
        Ok(())
    }

    /// `AddDataFile` in inline-hash mode: only the digest travels.
    pub async fn add_data_file_hash(
        &self,
        session: &PkiSession,
        file_name: &str,
        mime_type: &str,
        size: usize,
        digest: &[u8],
    ) -> Result<()> {
        self.call(
            "AddDataFile",
            &[
                ("Sesscode", session.sesscode.to_string()),
                ("FileName", file_name.to_string()),
                ("MimeType", mime_type.to_string()),
                ("ContentType", "HASHCODE".to_string()),
                ("Size", size.to_string()),
                ("DigestType", DIGEST_TYPE.to_string()),
                ("DigestValue", BASE64.encode(digest)),
            ],
        )
        .await?;
        Ok(())
    }

    /// `PrepareSignature`: register the signer certificate and get back the
    /// digest the smartcard must sign.
    pub async fn prepare_signature(
        &self,
        session: &PkiSession,
        certificate_b64: &str,
    ) -> Result<PreparedSignature> {
        let fields = self
            .call(
                "PrepareSignature",
                &[
                    ("Sesscode", session.sesscode.to_string()),
                    ("SignersCertificate", certificate_b64.to_string()),
                    ("SigningProfile", self.service_name.clone()),
                ],
            )
            .await?;
        Ok(PreparedSignature {
            signature_id: field(&fields, "SignatureId")?,
            digest_to_sign: field(&fields, "SignedInfoDigest")?,
        })
    }

    /// `FinalizeSignature`: attach the locally produced signature value.
    pub async fn finalize_signature(
        &self,
        session: &PkiSession,
        signature_id: &str,
        signature_value_b64: &str,
    ) -> Result<()> {
        self.call(
            "FinalizeSignature",
            &[
                ("Sesscode", session.sesscode.to_string()),
                ("SignatureId", signature_id.to_string()),
                ("SignatureValue", signature_value_b64.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    /// `GetSignedDoc`: download the completed, signed container.
    pub async fn get_signed_doc(&self, session: &PkiSession) -> Result<Vec<u8>> {
        let fields = self
            .call(
                "GetSignedDoc",
                &[("Sesscode", session.sesscode.to_string())],
            )
            .await?;
        decode_base64(&field(&fields, "SignedDocData")?)
    }

    /// `GetSignedDocInfo`: container-level metadata, flattened.
    pub async fn get_signed_doc_info(
        &self,
        session: &PkiSession,
    ) -> Result<BTreeMap<String, String>> {
        self.call(
            "GetSignedDocInfo",
            &[("Sesscode", session.sesscode.to_string())],
        )
        .await
    }

    /// `CloseSession`: release gateway-side session state.
    pub async fn close_session(&self, session: &PkiSession) -> Result<()> {
        self.call(
            "CloseSession",
            &[("Sesscode", session.sesscode.to_string())],
        )
        .await?;
        Ok(())
    }
}

/// Build a one-operation request envelope with escaped parameter values.
pub(crate) fn build_envelope(action: &str, params: &[(&str, String)]) -> String {
    // Writing into a Vec cannot fail.
    fn write(writer: &mut XmlWriter<Cursor<Vec<u8>>>, event: Event<'_>) {
        writer.write_event(event).expect("in-memory XML write");
    }

    let mut writer = XmlWriter::new(Cursor::new(Vec::new()));
    write(
        &mut writer,
        Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)),
    );
    let mut envelope = BytesStart::new("SOAP-ENV:Envelope");
    envelope.push_attribute(("xmlns:SOAP-ENV", SOAP_NS));
    write(&mut writer, Event::Start(envelope));
    write(&mut writer, Event::Start(BytesStart::new("SOAP-ENV:Body")));
    write(&mut writer, Event::Start(BytesStart::new(action)));
    for (name, value) in params {
        write(&mut writer, Event::Start(BytesStart::new(*name)));
        write(&mut writer, Event::Text(BytesText::new(value)));
        write(&mut writer, Event::End(BytesEnd::new(*name)));
    }
    write(&mut writer, Event::End(BytesEnd::new(action)));
    write(&mut writer, Event::End(BytesEnd::new("SOAP-ENV:Body")));
    write(&mut writer, Event::End(BytesEnd::new("SOAP-ENV:Envelope")));

    String::from_utf8(writer.into_inner().into_inner()).expect("XML writer emits UTF-8")
}

/// Flatten a response document into `{leaf element local name: text}`.
pub(crate) fn parse_response(xml: &str) -> Result<BTreeMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut fields = BTreeMap::new();
    let mut current: Option<String> = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                current = Some(String::from_utf8_lossy(e.local_name().as_ref()).to_string());
            }
            Ok(Event::Text(t)) => {
                if let Some(name) = current.take() {
                    let text = t
                        .unescape()
                        .map_err(|e| malformed(&format!("bad text content: {e}")))?;
                    fields.insert(name, text.to_string());
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(malformed(&format!("unparseable response: {e}"))),
        }
    }
    Ok(fields)
}

/// Surface an explicit gateway fault as [`Error::RemoteFault`].
pub(crate) fn check_fault(fields: &BTreeMap<String, String>) -> Result<()> {
    if let Some(code) = fields.get("faultstring") {
        let message = fields
            .get("message")
            .or_else(|| fields.get("faultcode"))
            .cloned()
            .unwrap_or_default();
        return Err(Error::RemoteFault {
            code: code.clone(),
            message,
        });
    }
    Ok(())
}

fn field(fields: &BTreeMap<String, String>, name: &str) -> Result<String> {
    fields
        .get(name)
        .cloned()
        .ok_or_else(|| malformed(&format!("response lacks {name}")))
}

fn malformed(message: &str) -> Error {
    Error::RemoteFault {
        code: "MALFORMED_RESPONSE".to_string(),
        message: message.to_string(),
    }
}

/// Base64 with the line breaks gateways like to insert.
pub(crate) fn decode_base64(value: &str) -> Result<Vec<u8>> {
    let compact: String = value.split_whitespace().collect();
    BASE64
        .decode(compact.as_bytes())
        .map_err(|e| malformed(&format!("bad base64 payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_contains_action_and_escaped_params() {
        let envelope = build_envelope(
            "StartSession",
            &[("SigningProfile", "a < b & \"c\"".to_string())],
        );
        assert!(envelope.contains("<StartSession>"));
        assert!(envelope.contains("</StartSession>"));
        assert!(envelope.contains("<SigningProfile>a &lt; b &amp; &quot;c&quot;</SigningProfile>"));
        assert!(!envelope.contains("a < b"));
    }

    #[test]
    fn response_fields_are_flattened_by_local_name() {
        let xml = r#"<?xml version="1.0"?>
            <SOAP-ENV:Envelope xmlns:SOAP-ENV="http://schemas.xmlsoap.org/soap/envelope/">
              <SOAP-ENV:Body>
                <d:StartSessionResponse xmlns:d="http://www.example.com/">
                  <Status>OK</Status>
                  <Sesscode>123456</Sesscode>
                </d:StartSessionResponse>
              </SOAP-ENV:Body>
            </SOAP-ENV:Envelope>"#;
        let fields = parse_response(xml).unwrap();
        assert_eq!(fields.get("Status").unwrap(), "OK");
        assert_eq!(fields.get("Sesscode").unwrap(), "123456");
    }

    #[test]
    fn faults_become_remote_faults() {
        let xml = r#"<SOAP-ENV:Envelope xmlns:SOAP-ENV="http://schemas.xmlsoap.org/soap/envelope/">
              <SOAP-ENV:Body>
                <SOAP-ENV:Fault>
                  <faultcode>SOAP-ENV:Client</faultcode>
                  <faultstring>101</faultstring>
                  <detail><message>Invalid input parameters</message></detail>
                </SOAP-ENV:Fault>
              </SOAP-ENV:Body>
            </SOAP-ENV:Envelope>"#;
        let fields = parse_response(xml).unwrap();
        let err = check_fault(&fields).unwrap_err();
        match err {
            Error::RemoteFault { code, message } => {
                assert_eq!(code, "101");
                assert_eq!(message, "Invalid input parameters");
            }
            other => panic!("expected RemoteFault, got {other:?}"),
        }
    }

    #[test]
    fn escaped_text_is_unescaped() {
        let xml = "<Response><Status>A &amp; B</Status></Response>";
        let fields = parse_response(xml).unwrap();
        assert_eq!(fields.get("Status").unwrap(), "A & B");
    }

    #[test]
    fn base64_with_line_breaks_decodes() {
        let encoded = "aGVs\nbG8g\nd29y\nbGQ=";
        assert_eq!(decode_base64(encoded).unwrap(), b"hello world");
    }
}
