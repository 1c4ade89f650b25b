//! NFC lease uploads.
//!
//! Once the platform accepts an import it grants a lease with one upload URL
//! per required file. Files are uploaded strictly one at a time, in the
//! order the lease lists them. A keep-alive thread reports overall progress
//! to the lease while uploads run. The first failed upload or checksum
//! mismatch aborts the lease; otherwise it is completed.

use std::collections::BTreeMap;
use std::thread;

use crossbeam_channel::{select, tick, Receiver};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cancel::CancelToken;
use crate::config::ImportConfig;
use crate::error::{Error, Result};
use crate::import_spec::FileItem;
use crate::manifest::{verify_server_checksum, Manifest};
use crate::package::Archive;
use crate::platform::{LeaseApi, LeaseInfo, ManagedObjectRef, Method, Transport, Trust, UploadOptions};
use crate::progress::{self, Progress, ProgressListener, ProgressReader, ProgressSender, Throttle};
use crate::session::{FileTransfer, SessionControl, TransferSession};

/// Content type for disks streamed into the platform.
pub const STREAM_VMDK_CONTENT_TYPE: &str = "application/x-vnd.vmware-streamVmdk";

/// Terminates a lease through the platform.
pub struct LeaseControl<'a, P: ?Sized> {
    api: &'a P,
    lease: ManagedObjectRef,
}

impl<'a, P: LeaseApi + ?Sized> LeaseControl<'a, P> {
    pub fn new(api: &'a P, lease: ManagedObjectRef) -> Self {
        Self { api, lease }
    }
}

impl<P: LeaseApi + ?Sized> SessionControl for LeaseControl<'_, P> {
    fn complete(&mut self) -> Result<()> {
        self.api.lease_complete(&self.lease)
    }

    fn abort(&mut self, reason: Option<&str>) -> Result<()> {
        self.api.lease_abort(&self.lease, reason)
    }
}

/// Request parameters for uploading one lease file.
///
/// Disks are `POST`ed as stream-optimized VMDK. Files the platform creates
/// (ISO images and the like) are `PUT` with `Overwrite: t`.
pub fn upload_options(file: &FileTransfer, content_length: u64) -> UploadOptions {
    if file.create {
        UploadOptions {
            method: Method::Put,
            content_type: None,
            content_length,
            headers: vec![("Overwrite".to_string(), "t".to_string())],
            trust: file.trust.clone(),
        }
    } else {
        UploadOptions {
            method: Method::Post,
            content_type: Some(STREAM_VMDK_CONTENT_TYPE.to_string()),
            content_length,
            headers: Vec::new(),
            trust: file.trust.clone(),
        }
    }
}

/// Drives one lease from ready to completed or aborted.
pub struct LeaseUploader<'a, P: ?Sized> {
    platform: &'a P,
    config: &'a ImportConfig,
    listener: &'a dyn ProgressListener,
    cancel: &'a CancelToken,
}

impl<'a, P> LeaseUploader<'a, P>
where
    P: LeaseApi + Transport + ?Sized,
{
    pub fn new(
        platform: &'a P,
        config: &'a ImportConfig,
        listener: &'a dyn ProgressListener,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            platform,
            config,
            listener,
            cancel,
        }
    }

    /// Upload every file the lease requires and complete it.
    ///
    /// `manifest` enables per-file checksum verification. Returns the
    /// created entity.
    ///
    /// # Errors
    ///
    /// A failed upload or verification aborts the lease and is returned as
    /// [`Error::Transfer`] naming the file. Cancellation aborts the lease
    /// and returns [`Error::Cancelled`].
    pub fn run(
        &self,
        lease: &ManagedObjectRef,
        items: &[FileItem],
        archive: &mut dyn Archive,
        manifest: Option<&Manifest>,
    ) -> Result<ManagedObjectRef> {
        let info = match self.platform.lease_wait(lease) {
            Ok(info) => info,
            Err(e) => {
                error!(lease = %lease, error = %e, "lease did not become ready");
                if let Err(abort) = self.platform.lease_abort(lease, None) {
                    warn!(lease = %lease, error = %abort, "abort failed");
                }
                return Err(e);
            }
        };

        let mut session = TransferSession::new(lease.value.clone(), LeaseControl::new(self.platform, lease.clone()));
        if let Err(e) = add_files(&mut session, &info, items, manifest) {
            error!(lease = %lease, error = %e, "cannot map lease URLs to import files");
            if let Err(abort) = session.abort(None) {
                warn!(lease = %lease, error = %abort, "abort failed");
            }
            return Err(e);
        }

        let total: u64 = session.files().iter().map(|f| f.size).sum();
        info!(lease = %lease, files = session.files().len(), total_bytes = total, "lease ready");

        let (sender, receiver) = progress::channel();
        let outcome = thread::scope(|scope| {
            let updater = scope.spawn(move || self.keep_alive(lease, receiver, total));

            let mut outcome = Ok(());
            for index in 0..session.files().len() {
                let name = session.files()[index].name.clone();
                if let Err(e) = self.upload_file(&mut session, index, lease, archive, manifest, &sender) {
                    if let Err(mark) = session.mark_failed(index) {
                        debug!(lease = %lease, file = %name, error = %mark, "cannot mark file failed");
                    }
                    outcome = Err((name, e));
                    break;
                }
            }

            drop(sender);
            if updater.join().is_err() {
                warn!(lease = %lease, "lease updater panicked");
            }
            outcome
        });

        match outcome {
            Ok(()) => {
                session.complete()?;
                info!(lease = %lease, entity = %info.entity, "import completed");
                Ok(info.entity)
            }
            Err((file, e)) => {
                error!(lease = %lease, file = %file, error = %e, "upload failed, aborting lease");
                if let Err(abort) = session.abort(Some(&file)) {
                    warn!(lease = %lease, error = %abort, "abort failed");
                }
                if e.is_cancelled() {
                    Err(Error::Cancelled)
                } else {
                    Err(Error::transfer(file, e))
                }
            }
        }
    }

    fn upload_file(
        &self,
        session: &mut TransferSession<LeaseControl<'_, P>>,
        index: usize,
        lease: &ManagedObjectRef,
        archive: &mut dyn Archive,
        manifest: Option<&Manifest>,
        sender: &ProgressSender,
    ) -> Result<()> {
        self.cancel.check()?;

        let (url, _) = session.endpoint(index)?;
        let file = session.file(index)?.clone();

        let member = archive.open(&file.name)?;
        let size = member.size();
        let options = upload_options(&file, size);
        debug!(file = %file.name, size, url = %url, method = ?options.method, "uploading");

        let mut reader = ProgressReader::new(member, &file.name, size, sender.clone(), self.cancel.clone());
        self.platform.upload(&url, &mut reader, &options)?;
        reader.finish();

        if let Some(manifest) = manifest {
            let sum = manifest.get(&file.name).ok_or_else(|| {
                Error::manifest(format!("missing checksum for {} in manifest file", file.name))
            })?;
            let server = self.platform.lease_manifest(lease)?;
            verify_server_checksum(&server, sum, &file.name, &file.key)?;
            debug!(file = %file.name, algorithm = %sum.algorithm, "checksum verified");
        }

        session.mark_transferred(index)
    }

    /// Forward samples to the listener and report overall progress to the
    /// lease until the uploads finish.
    fn keep_alive(&self, lease: &ManagedObjectRef, receiver: Receiver<Progress>, total: u64) {
        let mut throttle = Throttle::new(self.listener, self.config.progress_interval);
        let ticker = tick(self.config.lease_update_interval);
        let mut transferred: BTreeMap<String, u64> = BTreeMap::new();

        loop {
            select! {
                recv(receiver) -> msg => match msg {
                    Ok(sample) => {
                        transferred.insert(sample.file.clone(), sample.transferred);
                        throttle.offer(sample);
                    }
                    Err(_) => break,
                },
                recv(ticker) -> _ => {
                    throttle.flush();
                    let percent = overall_percent(&transferred, total);
                    if let Err(e) = self.platform.lease_progress(lease, percent) {
                        warn!(lease = %lease, error = %e, "lease progress update failed");
                    }
                }
            }
        }
        throttle.flush();
    }
}

fn add_files<C: SessionControl>(
    session: &mut TransferSession<C>,
    info: &LeaseInfo,
    items: &[FileItem],
    manifest: Option<&Manifest>,
) -> Result<()> {
    for device in &info.device_urls {
        let Some(item) = items.iter().find(|i| i.device_id == device.import_key) else {
            continue;
        };

        let url = Url::parse(&device.url)
            .map_err(|e| Error::session(format!("invalid lease URL '{}': {e}", device.url)))?;

        let mut file = FileTransfer::new(&item.path, item.size);
        file.key = device.key.clone();
        file.create = item.create;
        file.checksum = manifest.and_then(|m| m.get(&item.path)).cloned();

        let index = session.add_file(file);
        session.mark_prepared(index, url, Trust::from_thumbprint(device.ssl_thumbprint.as_deref()))?;
    }
    Ok(())
}

fn overall_percent(transferred: &BTreeMap<String, u64>, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let sent: u64 = transferred.values().sum();
    (sent.saturating_mul(100) / total).min(100) as u8
}
