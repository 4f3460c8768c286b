//! Artifact archiving for authorized documents.
//!
//! Three objects per document under `nfce/<company>/...`. Upload failures
//! are logged and swallowed: the request is already authorized, and a
//! reconciler can retry archiving from the event log.

use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::storage::ObjectStore;

/// URLs of whatever artifacts were archived successfully.
#[derive(Debug, Default, Clone)]
pub struct ArtifactUrls {
    /// Signed XML location.
    pub xml: Option<String>,
    /// DANFE PDF location.
    pub pdf: Option<String>,
    /// QR image location.
    pub qr: Option<String>,
}

/// One authorized document's artifacts, ready to store.
pub struct Artifacts<'a> {
    /// Signed XML bytes.
    pub signed_xml: &'a [u8],
    /// Rendered DANFE.
    pub danfe_pdf: &'a [u8],
    /// Rendered QR image.
    pub qr_png: &'a [u8],
}

/// Puts artifacts to the object store and records their URLs.
pub struct Archiver {
    store: Arc<dyn ObjectStore>,
}

impl Archiver {
    /// Wraps an object store.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Object key of the signed XML.
    #[must_use]
    pub fn xml_key(company_id: Uuid, access_key: &str) -> String {
        format!("nfce/{company_id}/xml/{access_key}.xml")
    }

    /// Object key of the DANFE PDF.
    #[must_use]
    pub fn pdf_key(company_id: Uuid, access_key: &str) -> String {
        format!("nfce/{company_id}/pdf/{access_key}.pdf")
    }

    /// Object key of the QR image.
    #[must_use]
    pub fn qr_key(company_id: Uuid, access_key: &str) -> String {
        format!("nfce/{company_id}/qr/{access_key}.png")
    }

    /// Archives all three artifacts, returning the URLs that succeeded.
    pub async fn archive(
        &self,
        company_id: Uuid,
        access_key: &str,
        artifacts: Artifacts<'_>,
    ) -> ArtifactUrls {
        let mut urls = ArtifactUrls::default();

        match self
            .store
            .put(
                &Self::xml_key(company_id, access_key),
                artifacts.signed_xml.to_vec(),
                "application/xml",
            )
            .await
        {
            Ok(url) => urls.xml = Some(url),
            Err(err) => warn!(%access_key, error = %err, "xml archive failed"),
        }

        match self
            .store
            .put(
                &Self::pdf_key(company_id, access_key),
                artifacts.danfe_pdf.to_vec(),
                "application/pdf",
            )
            .await
        {
            Ok(url) => urls.pdf = Some(url),
            Err(err) => warn!(%access_key, error = %err, "pdf archive failed"),
        }

        match self
            .store
            .put(
                &Self::qr_key(company_id, access_key),
                artifacts.qr_png.to_vec(),
                "image/png",
            )
            .await
        {
            Ok(url) => urls.qr = Some(url),
            Err(err) => warn!(%access_key, error = %err, "qr archive failed"),
        }

        urls
    }

    /// Reads one archived artifact back, for the download endpoints.
    ///
    /// # Errors
    ///
    /// Propagates [`crate::storage::StorageError`] from the backend.
    pub async fn fetch(
        &self,
        key: &str,
    ) -> Result<Option<Vec<u8>>, crate::storage::StorageError> {
        self.store.get(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;

    #[tokio::test]
    async fn archives_all_three_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::new(
            dir.path().to_path_buf(),
            "http://files".to_string(),
        ));
        let archiver = Archiver::new(storage);

        let company = Uuid::new_v4();
        let key = "35260812345678000195650010000000421076543212";
        let urls = archiver
            .archive(
                company,
                key,
                Artifacts {
                    signed_xml: b"<NFe/>",
                    danfe_pdf: b"%PDF-1.4",
                    qr_png: b"\x89PNG",
                },
            )
            .await;

        assert_eq!(
            urls.xml.as_deref(),
            Some(format!("http://files/nfce/{company}/xml/{key}.xml").as_str())
        );
        assert!(urls.pdf.is_some());
        assert!(urls.qr.is_some());

        let stored = archiver
            .fetch(&Archiver::xml_key(company, key))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, b"<NFe/>");
    }
}
