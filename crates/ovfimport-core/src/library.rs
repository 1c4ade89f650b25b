//! Content library update and download sessions.
//!
//! Uploads push package members into a library item through an update
//! session; downloads pull item files through a download session whose
//! files must be prepared, and polled until ready, before they can be read.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use tracing::{debug, error, info, warn};
use url::Url;

use crate::cancel::CancelToken;
use crate::config::{ImportConfig, PollPolicy};
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::ovf::Envelope;
use crate::package::Package;
use crate::platform::{LibraryApi, LibraryFile, Transport, UploadOptions};
use crate::progress::{self, ProgressListener, ProgressReader, ProgressSender};
use crate::session::{FileStatus, FileTransfer, SessionControl, TransferSession};

/// Terminates an update session: complete commits, abort cancels.
pub struct UpdateControl<'a, L: ?Sized> {
    api: &'a L,
    session: String,
}

impl<L: LibraryApi + ?Sized> SessionControl for UpdateControl<'_, L> {
    fn complete(&mut self) -> Result<()> {
        self.api.complete_update_session(&self.session)
    }

    fn abort(&mut self, reason: Option<&str>) -> Result<()> {
        if let Some(file) = reason {
            debug!(session = %self.session, file, "cancelling update session");
        }
        self.api.cancel_update_session(&self.session)
    }
}

/// Terminates a download session; both outcomes delete it.
pub struct DownloadControl<'a, L: ?Sized> {
    api: &'a L,
    session: String,
}

impl<L: LibraryApi + ?Sized> SessionControl for DownloadControl<'_, L> {
    fn complete(&mut self) -> Result<()> {
        self.api.delete_download_session(&self.session)
    }

    fn abort(&mut self, _reason: Option<&str>) -> Result<()> {
        self.api.delete_download_session(&self.session)
    }
}

fn endpoint_url(file: &LibraryFile) -> Result<(Url, crate::platform::Trust)> {
    let endpoint = file
        .endpoint
        .as_ref()
        .ok_or_else(|| Error::session(format!("no transfer endpoint for {}", file.name)))?;
    let url = Url::parse(&endpoint.uri)
        .map_err(|e| Error::session(format!("invalid endpoint '{}': {e}", endpoint.uri)))?;
    Ok((url, endpoint.trust()))
}

/// True for a non-empty name made only of normal path components.
fn is_contained(name: &str) -> bool {
    let path = Path::new(name);
    path.components().next().is_some() && path.components().all(|c| matches!(c, Component::Normal(_)))
}

fn finish<C: SessionControl>(
    session: TransferSession<C>,
    outcome: std::result::Result<(), (String, Error)>,
) -> Result<Vec<FileTransfer>> {
    match outcome {
        Ok(()) => session.complete(),
        Err((file, e)) => {
            error!(session = %session.id(), file = %file, error = %e, "library transfer failed, cancelling session");
            let reason = (!file.is_empty()).then_some(file.as_str());
            if let Err(abort) = session.abort(reason) {
                warn!(error = %abort, "session cancel failed");
            }
            if e.is_cancelled() {
                Err(Error::Cancelled)
            } else if file.is_empty() {
                Err(e)
            } else {
                Err(Error::transfer(file, e))
            }
        }
    }
}

/// Pushes package members into a library item.
pub struct LibraryUploader<'a, L: ?Sized> {
    api: &'a L,
    config: &'a ImportConfig,
    listener: &'a dyn ProgressListener,
    cancel: &'a CancelToken,
}

impl<'a, L> LibraryUploader<'a, L>
where
    L: LibraryApi + Transport + ?Sized,
{
    pub fn new(
        api: &'a L,
        config: &'a ImportConfig,
        listener: &'a dyn ProgressListener,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            api,
            config,
            listener,
            cancel,
        }
    }

    /// Upload the package descriptor and, for OVF packages, every file it
    /// references. Checksums come from `manifest` when given.
    ///
    /// Returns the uploaded file names.
    pub fn upload(
        &self,
        item_id: &str,
        package: &mut Package,
        manifest: Option<&Manifest>,
    ) -> Result<Vec<String>> {
        let mut names = vec![package.descriptor_name().to_string()];
        if names[0].to_ascii_lowercase().ends_with(".ovf") {
            let descriptor = package.read_descriptor()?;
            let envelope = Envelope::parse(&descriptor.text)?;
            names = vec![descriptor.name];
            names.extend(envelope.references.iter().map(|r| r.href.clone()));
        }

        let id = self.api.create_update_session(item_id)?;
        info!(item = item_id, session = %id, files = names.len(), "update session created");
        let mut session = TransferSession::new(
            id.clone(),
            UpdateControl {
                api: self.api,
                session: id,
            },
        );

        let (sender, receiver) = progress::channel();
        let listener = self.listener;
        let interval = self.config.progress_interval;

        let outcome = std::thread::scope(|scope| {
            let reporter = scope.spawn(move || progress::report(receiver, listener, interval));
            let mut outcome = Ok(Vec::with_capacity(names.len()));
            for name in &names {
                match self.upload_one(&mut session, package, name, manifest, &sender) {
                    Ok(uploaded) => {
                        if let Ok(list) = &mut outcome {
                            list.push(uploaded);
                        }
                    }
                    Err(e) => {
                        outcome = Err((name.clone(), e));
                        break;
                    }
                }
            }
            drop(sender);
            if reporter.join().is_err() {
                warn!("progress reporter panicked");
            }
            outcome
        });

        let outcome = outcome.and_then(|uploaded| {
            self.validate(session.id())
                .map(|()| uploaded)
                .map_err(|e| (String::new(), e))
        });
        let uploaded = match outcome {
            Ok(uploaded) => uploaded,
            Err(failure) => return finish(session, Err(failure)).map(|_| Vec::new()),
        };
        finish(session, Ok(()))?;
        info!(item = item_id, files = uploaded.len(), "library item updated");
        Ok(uploaded)
    }

    fn upload_one<C: SessionControl>(
        &self,
        session: &mut TransferSession<C>,
        package: &mut Package,
        name: &str,
        manifest: Option<&Manifest>,
        sender: &ProgressSender,
    ) -> Result<String> {
        self.cancel.check()?;

        let member = package.archive().open(name)?;
        let size = member.size();
        let literal = Path::new(member.name())
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| member.name().to_string());
        let checksum = manifest.and_then(|m| m.get(&literal));

        let added = self.api.add_file(session.id(), &literal, size, checksum)?;
        if added.status == FileStatus::Error {
            return Err(Error::platform(
                added
                    .error_message
                    .unwrap_or_else(|| format!("cannot add {literal}")),
            ));
        }

        let mut file = FileTransfer::new(&literal, size);
        file.checksum = checksum.cloned();
        let index = session.add_file(file);
        let (url, trust) = endpoint_url(&added)?;
        session.mark_prepared(index, url.clone(), trust.clone())?;

        debug!(file = %literal, size, url = %url, "uploading library file");
        let mut reader = ProgressReader::new(member, &literal, size, sender.clone(), self.cancel.clone());
        if let Err(e) = self.api.upload(&url, &mut reader, &UploadOptions::put(size, trust)) {
            if let Err(mark) = session.mark_failed(index) {
                debug!(file = %literal, error = %mark, "cannot mark file failed");
            }
            return Err(e);
        }
        reader.finish();
        session.mark_transferred(index)?;
        Ok(literal)
    }

    fn validate(&self, session: &str) -> Result<()> {
        let validation = self.api.validate_update_session(session)?;
        if !validation.has_errors {
            return Ok(());
        }

        let mut problems: Vec<String> = validation
            .missing_files
            .iter()
            .map(|f| format!("{f}: missing"))
            .collect();
        problems.extend(
            validation
                .invalid_files
                .iter()
                .map(|(f, message)| format!("{f}: {message}")),
        );
        Err(Error::session(format!(
            "update session validation failed: {}",
            problems.join("; ")
        )))
    }
}

/// Pulls library item files through a download session.
pub struct LibraryDownloader<'a, L: ?Sized> {
    api: &'a L,
    config: &'a ImportConfig,
    listener: &'a dyn ProgressListener,
    cancel: &'a CancelToken,
}

impl<'a, L> LibraryDownloader<'a, L>
where
    L: LibraryApi + Transport + ?Sized,
{
    pub fn new(
        api: &'a L,
        config: &'a ImportConfig,
        listener: &'a dyn ProgressListener,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            api,
            config,
            listener,
            cancel,
        }
    }

    /// Download `names` (every file of the item when empty) into `dir`.
    ///
    /// # Errors
    ///
    /// [`Error::Session`] for a file name that is not a plain relative path
    /// below `dir`; the session is cancelled and nothing is written for it.
    pub fn download_to_dir(&self, item_id: &str, names: &[String], dir: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(dir).map_err(|e| Error::io(e, dir))?;
        let mut written = Vec::new();
        self.download(item_id, names, |name| {
            if !is_contained(name) {
                return Err(Error::session(format!(
                    "refusing to write {name:?} outside {}",
                    dir.display()
                )));
            }
            let path = dir.join(name);
            let file = File::create(&path).map_err(|e| Error::io(e, &path))?;
            written.push(path);
            Ok(BufWriter::new(file))
        })?;
        Ok(written)
    }

    /// Download `names` (every file of the item when empty), writing each
    /// into the sink `open` returns for it.
    ///
    /// Files are prepared up front, then each is polled until prepared and
    /// streamed, one at a time. Returns the downloaded file names.
    pub fn download<F, W>(&self, item_id: &str, names: &[String], mut open: F) -> Result<Vec<String>>
    where
        F: FnMut(&str) -> Result<W>,
        W: Write,
    {
        let id = self.api.create_download_session(item_id)?;
        info!(item = item_id, session = %id, "download session created");
        let mut session = TransferSession::new(
            id.clone(),
            DownloadControl {
                api: self.api,
                session: id,
            },
        );

        let names = if names.is_empty() {
            match self.api.list_download_files(session.id()) {
                Ok(files) => files.into_iter().map(|f| f.name).collect(),
                Err(e) => return finish(session, Err((String::new(), e))).map(|_| Vec::new()),
            }
        } else {
            names.to_vec()
        };

        let (sender, receiver) = progress::channel();
        let listener = self.listener;
        let interval = self.config.progress_interval;

        let outcome = std::thread::scope(|scope| {
            let reporter = scope.spawn(move || progress::report(receiver, listener, interval));
            let outcome = self.transfer_all(&mut session, &names, &mut open, &sender);
            drop(sender);
            if reporter.join().is_err() {
                warn!("progress reporter panicked");
            }
            outcome
        });

        finish(session, outcome)?;
        info!(item = item_id, files = names.len(), "library item downloaded");
        Ok(names)
    }

    fn transfer_all<C, F, W>(
        &self,
        session: &mut TransferSession<C>,
        names: &[String],
        open: &mut F,
        sender: &ProgressSender,
    ) -> std::result::Result<(), (String, Error)>
    where
        C: SessionControl,
        F: FnMut(&str) -> Result<W>,
        W: Write,
    {
        for name in names {
            let index = session.add_file(FileTransfer::new(name, 0));
            self.api
                .prepare_download_file(session.id(), name)
                .and_then(|_| session.mark_prepare_requested(index))
                .map_err(|e| (name.clone(), e))?;
        }

        for (index, name) in names.iter().enumerate() {
            self.download_one(session, index, name, open, sender)
                .map_err(|e| {
                    if let Err(mark) = session.mark_failed(index) {
                        debug!(file = %name, error = %mark, "cannot mark file failed");
                    }
                    (name.clone(), e)
                })?;
        }
        Ok(())
    }

    fn download_one<C, F, W>(
        &self,
        session: &mut TransferSession<C>,
        index: usize,
        name: &str,
        open: &mut F,
        sender: &ProgressSender,
    ) -> Result<()>
    where
        C: SessionControl,
        F: FnMut(&str) -> Result<W>,
        W: Write,
    {
        let prepared = wait_prepared(self.api, session.id(), name, &self.config.poll, self.cancel)?;
        let (url, trust) = endpoint_url(&prepared)?;
        session.mark_prepared(index, url.clone(), trust.clone())?;

        let mut sink = open(name)?;
        let download = self.api.download(&url, &trust)?;
        let total = download.content_length.unwrap_or(prepared.size);
        let mut reader = ProgressReader::new(download.reader, name, total, sender.clone(), self.cancel.clone());

        debug!(file = name, url = %url, "downloading library file");
        let copied = io::copy(&mut reader, &mut sink)?;
        sink.flush()?;
        reader.finish();

        debug!(file = name, bytes = copied, "downloaded");
        session.mark_transferred(index)
    }
}

/// Poll a download file until it is prepared.
///
/// Waits grow by `policy` between polls. An `ERROR` status fails at once;
/// exceeding `policy.max_wait` fails with [`Error::Session`].
pub fn wait_prepared<L: LibraryApi + ?Sized>(
    api: &L,
    session: &str,
    name: &str,
    policy: &PollPolicy,
    cancel: &CancelToken,
) -> Result<LibraryFile> {
    let started = Instant::now();
    let mut interval = policy.initial_interval;

    loop {
        let file = api.get_download_file(session, name)?;
        match file.status {
            FileStatus::Prepared => return Ok(file),
            FileStatus::Error => {
                return Err(Error::platform(format!(
                    "preparing {name} failed: {}",
                    file.error_message.as_deref().unwrap_or("unknown error")
                )))
            }
            status => debug!(file = name, ?status, "waiting for file to be prepared"),
        }

        let elapsed = started.elapsed();
        if elapsed >= policy.max_wait {
            return Err(Error::session(format!(
                "{name} was not prepared within {:?}",
                policy.max_wait
            )));
        }
        cancel.sleep(interval.min(policy.max_wait - elapsed))?;
        interval = policy.next_interval(interval);
    }
}
