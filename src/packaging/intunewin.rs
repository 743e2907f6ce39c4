//! `.intunewin` container
//!
//! The container is a zip with two entries:
//!
//! ```text
//! IntuneWinPackage/Contents/IntunePackage.intunewin   encrypted inner zip (stored)
//! IntuneWinPackage/Metadata/Detection.xml             ApplicationInfo metadata
//! ```
//!
//! The inner zip holds the source folder. Its encryption keys travel in
//! `Detection.xml` and are handed to Intune when the content file is committed.

use super::crypto::{self, DecryptedPayload, EncryptedPayload};
use crate::error::{IntunePackError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const CONTENT_ENTRY: &str = "IntuneWinPackage/Contents/IntunePackage.intunewin";
pub const METADATA_ENTRY: &str = "IntuneWinPackage/Metadata/Detection.xml";
pub const PAYLOAD_FILE_NAME: &str = "IntunePackage.intunewin";
const PROFILE_IDENTIFIER: &str = "ProfileVersion1";
const DIGEST_ALGORITHM: &str = "SHA256";
const TOOL_VERSION: &str = "1.8.6.0";

/// `EncryptionInfo` block, also the `fileEncryptionInfo` sent on commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionInfo {
    pub encryption_key: String,
    pub mac_key: String,
    pub initialization_vector: String,
    pub mac: String,
    pub profile_identifier: String,
    pub file_digest: String,
    pub file_digest_algorithm: String,
}

impl From<&EncryptedPayload> for EncryptionInfo {
    fn from(payload: &EncryptedPayload) -> Self {
        Self {
            encryption_key: payload.encryption_key_b64(),
            mac_key: payload.mac_key_b64(),
            initialization_vector: payload.iv_b64(),
            mac: payload.mac_b64(),
            profile_identifier: PROFILE_IDENTIFIER.to_string(),
            file_digest: payload.file_digest_b64(),
            file_digest_algorithm: DIGEST_ALGORITHM.to_string(),
        }
    }
}

/// Contents of `Detection.xml`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationInfo {
    pub name: String,
    pub unencrypted_content_size: u64,
    pub file_name: String,
    pub setup_file: String,
    pub encryption_info: EncryptionInfo,
    pub msi_product_code: Option<String>,
}

fn write_text<W: Write>(writer: &mut Writer<W>, tag: &str, text: &str) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

impl ApplicationInfo {
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;

        let root = BytesStart::new("ApplicationInfo").with_attributes([
            ("xmlns:xsd", "http://www.w3.org/2001/XMLSchema"),
            ("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance"),
            ("ToolVersion", TOOL_VERSION),
        ]);
        writer.write_event(Event::Start(root))?;

        write_text(&mut writer, "Name", &self.name)?;
        write_text(
            &mut writer,
            "UnencryptedContentSize",
            &self.unencrypted_content_size.to_string(),
        )?;
        write_text(&mut writer, "FileName", &self.file_name)?;
        write_text(&mut writer, "SetupFile", &self.setup_file)?;

        let enc = &self.encryption_info;
        writer.write_event(Event::Start(BytesStart::new("EncryptionInfo")))?;
        write_text(&mut writer, "EncryptionKey", &enc.encryption_key)?;
        write_text(&mut writer, "MacKey", &enc.mac_key)?;
        write_text(&mut writer, "InitializationVector", &enc.initialization_vector)?;
        write_text(&mut writer, "Mac", &enc.mac)?;
        write_text(&mut writer, "ProfileIdentifier", &enc.profile_identifier)?;
        write_text(&mut writer, "FileDigest", &enc.file_digest)?;
        write_text(&mut writer, "FileDigestAlgorithm", &enc.file_digest_algorithm)?;
        writer.write_event(Event::End(BytesEnd::new("EncryptionInfo")))?;

        if let Some(code) = &self.msi_product_code {
            writer.write_event(Event::Start(BytesStart::new("MsiInfo")))?;
            write_text(&mut writer, "MsiProductCode", code)?;
            writer.write_event(Event::End(BytesEnd::new("MsiInfo")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("ApplicationInfo")))?;

        String::from_utf8(writer.into_inner().into_inner())
            .map_err(|e| IntunePackError::PackagingError(format!("Detection.xml is not UTF-8: {}", e)))
    }

    pub fn from_xml(xml: &str) -> Result<Self> {
        // Text content keyed by element path, e.g. "EncryptionInfo/Mac"
        let mut values: HashMap<String, String> = HashMap::new();
        let mut path: Vec<String> = Vec::new();
        let mut reader = Reader::from_str(xml);

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    path.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned())
                }
                Event::End(_) => {
                    path.pop();
                }
                Event::Text(e) => {
                    let text = e.unescape()?;
                    let text = text.trim();
                    if !text.is_empty() && path.len() > 1 {
                        values.insert(path[1..].join("/"), text.to_string());
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        let required = |key: &str| {
            values.get(key).cloned().ok_or_else(|| {
                IntunePackError::PackagingError(format!("Detection.xml is missing <{}>", key))
            })
        };

        let size = required("UnencryptedContentSize")?;
        Ok(Self {
            name: required("Name")?,
            unencrypted_content_size: size.parse().map_err(|_| {
                IntunePackError::PackagingError(format!("Invalid UnencryptedContentSize '{}'", size))
            })?,
            file_name: required("FileName")?,
            setup_file: required("SetupFile")?,
            encryption_info: EncryptionInfo {
                encryption_key: required("EncryptionInfo/EncryptionKey")?,
                mac_key: required("EncryptionInfo/MacKey")?,
                initialization_vector: required("EncryptionInfo/InitializationVector")?,
                mac: required("EncryptionInfo/Mac")?,
                profile_identifier: required("EncryptionInfo/ProfileIdentifier")?,
                file_digest: required("EncryptionInfo/FileDigest")?,
                file_digest_algorithm: required("EncryptionInfo/FileDigestAlgorithm")?,
            },
            msi_product_code: values.get("MsiInfo/MsiProductCode").cloned(),
        })
    }
}

/// An `.intunewin` file on disk
#[derive(Debug, Clone)]
pub struct IntuneWinPackage {
    pub path: PathBuf,
    pub info: ApplicationInfo,
}

/// Zip `source_dir` into `out`, entries sorted and relative with `/` separators
fn zip_folder<W: Write + Seek>(source_dir: &Path, out: W) -> Result<W> {
    let mut zip = ZipWriter::new(out);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(|e| IntunePackError::PackagingError(e.to_string()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        zip.start_file(name, options)?;
        let mut file = File::open(entry.path())?;
        io::copy(&mut file, &mut zip)?;
    }

    Ok(zip.finish()?)
}

impl IntuneWinPackage {
    /// Package `source_dir` into `<output_dir>/<setup stem>.intunewin`
    pub fn create(
        source_dir: &Path,
        setup_file: &str,
        output_dir: &Path,
        msi_product_code: Option<&str>,
    ) -> Result<Self> {
        if !source_dir.is_dir() {
            return Err(IntunePackError::PackagingError(format!(
                "Source folder does not exist: {}",
                source_dir.display()
            )));
        }
        if !source_dir.join(setup_file).is_file() {
            return Err(IntunePackError::PackagingError(format!(
                "Setup file '{}' not found in {}",
                setup_file,
                source_dir.display()
            )));
        }

        let setup_name = Path::new(setup_file)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| setup_file.to_string());
        let stem = Path::new(&setup_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| setup_name.clone());

        fs::create_dir_all(output_dir)?;
        let output = output_dir.join(format!("{}.intunewin", stem));

        tracing::debug!("Zipping {}", source_dir.display());
        let mut inner = zip_folder(source_dir, tempfile::tempfile()?)?;
        inner.seek(SeekFrom::Start(0))?;

        let mut encrypted = tempfile::tempfile()?;
        let payload = crypto::encrypt_stream(&mut inner, &mut encrypted)?;
        encrypted.seek(SeekFrom::Start(0))?;
        tracing::debug!(
            "Encrypted {} bytes into {} bytes",
            payload.plain_size,
            payload.encrypted_size
        );

        let msi_product_code = if setup_name.to_lowercase().ends_with(".msi") {
            msi_product_code.map(str::to_string)
        } else {
            None
        };
        let info = ApplicationInfo {
            name: setup_name.clone(),
            unencrypted_content_size: payload.plain_size,
            file_name: PAYLOAD_FILE_NAME.to_string(),
            setup_file: setup_file.replace('\\', "/"),
            encryption_info: EncryptionInfo::from(&payload),
            msi_product_code,
        };

        let mut outer = ZipWriter::new(File::create(&output)?);
        let stored = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .large_file(payload.encrypted_size >= u32::MAX as u64);
        outer.start_file(CONTENT_ENTRY, stored)?;
        io::copy(&mut encrypted, &mut outer)?;

        let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        outer.start_file(METADATA_ENTRY, deflated)?;
        outer.write_all(info.to_xml()?.as_bytes())?;
        outer.finish()?;

        tracing::info!("Created {}", output.display());
        Ok(Self { path: output, info })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let mut archive = ZipArchive::new(File::open(path)?)?;
        let mut xml = String::new();
        archive
            .by_name(METADATA_ENTRY)
            .map_err(|_| {
                IntunePackError::PackagingError(format!(
                    "{} is not an .intunewin file (no {})",
                    path.display(),
                    METADATA_ENTRY
                ))
            })?
            .read_to_string(&mut xml)?;

        Ok(Self {
            path: path.to_path_buf(),
            info: ApplicationInfo::from_xml(xml.trim_start_matches('\u{feff}'))?,
        })
    }

    /// Size of the encrypted payload, the `sizeEncrypted` Graph expects
    pub fn encrypted_size(&self) -> Result<u64> {
        let mut archive = ZipArchive::new(File::open(&self.path)?)?;
        let entry = archive.by_name(CONTENT_ENTRY)?;
        Ok(entry.size())
    }

    /// Copy the encrypted payload to `dest`
    pub fn extract_payload(&self, dest: &mut impl Write) -> Result<u64> {
        let mut archive = ZipArchive::new(File::open(&self.path)?)?;
        let mut entry = archive.by_name(CONTENT_ENTRY)?;
        Ok(io::copy(&mut entry, dest)?)
    }

    /// Decrypt the payload into a temporary file, positioned at its start
    fn decrypt_payload(&self) -> Result<(DecryptedPayload, File)> {
        let enc = &self.info.encryption_info;
        let decode = |field: &str, value: &str| {
            BASE64.decode(value).map_err(|e| {
                IntunePackError::CryptoError(format!("Invalid {} in Detection.xml: {}", field, e))
            })
        };
        let key = decode("EncryptionKey", &enc.encryption_key)?;
        let mac_key = decode("MacKey", &enc.mac_key)?;

        let mut encrypted = tempfile::tempfile()?;
        self.extract_payload(&mut encrypted)?;
        encrypted.seek(SeekFrom::Start(0))?;

        let mut plain = tempfile::tempfile()?;
        let decrypted = crypto::decrypt_stream(&mut encrypted, &mut plain, &key, &mac_key)?;
        plain.seek(SeekFrom::Start(0))?;
        Ok((decrypted, plain))
    }

    /// Decrypt the payload and check the MAC, digest, size and setup file
    pub fn verify(&self) -> Result<()> {
        let (decrypted, plain) = self.decrypt_payload()?;
        let enc = &self.info.encryption_info;

        if BASE64.encode(decrypted.mac) != enc.mac {
            return Err(IntunePackError::CryptoError(
                "Mac in Detection.xml does not match the payload".into(),
            ));
        }
        if decrypted.plain_size != self.info.unencrypted_content_size {
            return Err(IntunePackError::CryptoError(format!(
                "Decrypted size {} does not match UnencryptedContentSize {}",
                decrypted.plain_size, self.info.unencrypted_content_size
            )));
        }
        if BASE64.encode(decrypted.file_digest) != enc.file_digest {
            return Err(IntunePackError::CryptoError(
                "FileDigest does not match decrypted content".into(),
            ));
        }

        let mut inner = ZipArchive::new(plain)?;
        if inner.by_name(&self.info.setup_file).is_err() {
            return Err(IntunePackError::PackagingError(format!(
                "Setup file '{}' is missing from the payload",
                self.info.setup_file
            )));
        }
        Ok(())
    }

    /// Relative paths stored in the payload
    pub fn payload_entries(&self) -> Result<Vec<String>> {
        let (_, plain) = self.decrypt_payload()?;
        let inner = ZipArchive::new(plain)?;
        Ok(inner.file_names().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_folder() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("setup.msi"), b"MSI payload").unwrap();
        fs::create_dir_all(dir.path().join("Files/sub")).unwrap();
        fs::write(dir.path().join("Files/sub/config.ini"), b"[core]\nkey=value\n").unwrap();
        dir
    }

    #[test]
    fn test_create_then_open_and_verify() {
        let src = source_folder();
        let out = tempfile::tempdir().unwrap();
        let code = "{11111111-2222-3333-4444-555555555555}";

        let created = IntuneWinPackage::create(src.path(), "setup.msi", out.path(), Some(code))
            .unwrap();
        assert_eq!(created.path, out.path().join("setup.intunewin"));

        let opened = IntuneWinPackage::open(&created.path).unwrap();
        assert_eq!(opened.info, created.info);
        assert_eq!(opened.info.msi_product_code.as_deref(), Some(code));
        assert_eq!(opened.info.encryption_info.profile_identifier, "ProfileVersion1");

        opened.verify().unwrap();
        let entries = opened.payload_entries().unwrap();
        assert!(entries.contains(&"Files/sub/config.ini".to_string()));

        let mut payload = Vec::new();
        let copied = opened.extract_payload(&mut payload).unwrap();
        assert_eq!(copied, opened.encrypted_size().unwrap());
    }

    #[test]
    fn test_verify_payload_larger_than_read_buffer() {
        use rand::RngCore;

        let src = tempfile::tempdir().unwrap();
        let mut data = vec![0u8; 300 * 1024];
        rand::thread_rng().fill_bytes(&mut data);
        fs::write(src.path().join("setup.exe"), &data).unwrap();
        let out = tempfile::tempdir().unwrap();

        let pkg = IntuneWinPackage::create(src.path(), "setup.exe", out.path(), None).unwrap();
        assert!(pkg.encrypted_size().unwrap() > data.len() as u64);
        pkg.verify().unwrap();
        assert_eq!(pkg.payload_entries().unwrap(), vec!["setup.exe".to_string()]);
    }

    #[test]
    fn test_missing_setup_file_is_rejected() {
        let src = source_folder();
        let out = tempfile::tempdir().unwrap();
        let err = IntuneWinPackage::create(src.path(), "install.exe", out.path(), None).unwrap_err();
        assert!(err.to_string().contains("install.exe"));
    }

    #[test]
    fn test_exe_setup_drops_product_code() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("setup.exe"), b"MZ").unwrap();
        let out = tempfile::tempdir().unwrap();
        let pkg = IntuneWinPackage::create(
            src.path(),
            "setup.exe",
            out.path(),
            Some("{11111111-2222-3333-4444-555555555555}"),
        )
        .unwrap();
        assert!(pkg.info.msi_product_code.is_none());
        assert!(!pkg.info.to_xml().unwrap().contains("MsiInfo"));
    }

    #[test]
    fn test_xml_escapes_names() {
        let info = ApplicationInfo {
            name: "R&D <tools>.exe".into(),
            unencrypted_content_size: 42,
            file_name: PAYLOAD_FILE_NAME.into(),
            setup_file: "R&D <tools>.exe".into(),
            encryption_info: EncryptionInfo {
                encryption_key: "a".into(),
                mac_key: "b".into(),
                initialization_vector: "c".into(),
                mac: "d".into(),
                profile_identifier: PROFILE_IDENTIFIER.into(),
                file_digest: "e".into(),
                file_digest_algorithm: DIGEST_ALGORITHM.into(),
            },
            msi_product_code: None,
        };
        let xml = info.to_xml().unwrap();
        assert!(xml.contains("R&amp;D &lt;tools&gt;.exe"));
        assert_eq!(ApplicationInfo::from_xml(&xml).unwrap(), info);
    }

    #[test]
    fn test_tampered_payload_fails_verification() {
        let src = source_folder();
        let out = tempfile::tempdir().unwrap();
        let pkg = IntuneWinPackage::create(src.path(), "setup.msi", out.path(), None).unwrap();

        let mut payload = Vec::new();
        pkg.extract_payload(&mut payload).unwrap();
        let last = payload.len() - 1;
        payload[last] ^= 0xff;

        let tampered_path = out.path().join("tampered.intunewin");
        let mut zip = ZipWriter::new(File::create(&tampered_path).unwrap());
        zip.start_file(CONTENT_ENTRY, SimpleFileOptions::default()).unwrap();
        zip.write_all(&payload).unwrap();
        zip.start_file(METADATA_ENTRY, SimpleFileOptions::default()).unwrap();
        zip.write_all(pkg.info.to_xml().unwrap().as_bytes()).unwrap();
        zip.finish().unwrap();

        let tampered = IntuneWinPackage::open(&tampered_path).unwrap();
        assert!(tampered.verify().is_err());
    }
}
