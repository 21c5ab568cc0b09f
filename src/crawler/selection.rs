//! URL selection: manual retry, custom queue, start page, automatic queue.

use crate::db::urls::ModuleFlag;
use crate::supervisor::WorkerError;

use super::{CrawlerWorker, IdString};

impl CrawlerWorker {
    /// Pick the next URL to crawl and lock it. Returns `None` when there is
    /// nothing to do (idle). The boolean says whether to use POST.
    pub(crate) async fn select_url(&mut self) -> Result<Option<(IdString, bool)>, WorkerError> {
        // manual phase lasts until the automatic queue has made progress
        if self.state.last_url_id() == 0 {
            if let Some(selected) = self.select_manual().await? {
                return Ok(Some(selected));
            }
        }

        if self.manual_url.is_some() {
            return Ok(None);
        }

        self.select_automatic().await
    }

    /// Manual crawling: retry the failed manual URL, then the custom queue,
    /// then the start page.
    async fn select_manual(&mut self) -> Result<Option<(IdString, bool)>, WorkerError> {
        // retry a manual URL that failed with a retry verdict
        if let Some(manual) = self.manual_url.clone() {
            match self
                .locks
                .lock_if_ok(manual.0, &self.lock, self.config.lock_secs)
                .await?
            {
                Some(lease) => {
                    self.lock = lease;

                    let url = self.replace_tokens(&manual).await?;

                    return Ok(Some((url, self.config.custom_use_post)));
                }
                None => {
                    if self.config.verbose {
                        self.log(&format!("URL lock active - {} skipped", manual.1))
                            .await;
                    }

                    self.manual_url = None;
                    self.lock.clear();
                }
            }
        }

        // custom queue
        if !self.custom_pages.is_empty() && self.manual_counter < self.custom_pages.len() {
            if self.manual_counter == 0 && self.config.verbose {
                self.log("starts crawling in non-recoverable MANUAL mode").await;
            }

            while self.manual_counter < self.custom_pages.len() {
                let candidate = self.custom_pages[self.manual_counter].clone();

                // skip custom URLs already crawled unless re-crawling
                if !self.config.recrawl_custom
                    && self
                        .db
                        .is_url_flagged(&self.ns, candidate.0, ModuleFlag::Crawled)
                        .await?
                {
                    self.manual_counter += 1;

                    continue;
                }

                match self
                    .locks
                    .lock_if_ok(candidate.0, &self.lock, self.config.lock_secs)
                    .await?
                {
                    Some(lease) => {
                        self.lock = lease;
                        self.manual_url = Some(candidate.clone());

                        let url = self.replace_tokens(&candidate).await?;

                        return Ok(Some((url, self.config.custom_use_post)));
                    }
                    None => {
                        if self.config.verbose {
                            self.log(&format!("URL lock active - {} skipped", candidate.1))
                                .await;
                        }

                        self.manual_counter += 1;
                    }
                }
            }
        }

        // start page
        if self.manual_counter >= self.custom_pages.len()
            && !self.config.start_ignore
            && !self.start_crawled
        {
            let recrawl = self.config.recrawl_start;

            if recrawl
                || !self
                    .db
                    .is_url_flagged(&self.ns, self.start_page.0, ModuleFlag::Crawled)
                    .await?
            {
                match self
                    .locks
                    .lock_if_ok(self.start_page.0, &self.lock, self.config.lock_secs)
                    .await?
                {
                    Some(lease) => {
                        self.lock = lease;
                        self.manual_url = Some(self.start_page.clone());

                        return Ok(Some((self.start_page.clone(), false)));
                    }
                    None => {
                        if self.config.verbose {
                            self.log(&format!(
                                "URL lock active - {} skipped",
                                self.start_page.1
                            ))
                            .await;
                        }

                        self.start_crawled = true;
                    }
                }
            } else {
                self.start_crawled = true;
            }
        }

        Ok(None)
    }

    /// Automatic crawling: retry the previous URL if its lock can be
    /// renewed, else take the next unprocessed URL after the cursor, moving
    /// past locked rows.
    async fn select_automatic(&mut self) -> Result<Option<(IdString, bool)>, WorkerError> {
        if !self.manual_off {
            self.log("switches to recoverable AUTOMATIC mode").await;

            self.manual_off = true;
        }

        // retry the last URL if we still hold (or can renew) its lock
        if let Some(next) = self.next_url.clone() {
            match self
                .locks
                .lock_if_ok(next.0, &self.lock, self.config.lock_secs)
                .await?
            {
                Some(lease) => {
                    self.lock = lease;

                    self.log(&format!("retries {}...", next.1)).await;

                    return Ok(Some((next, false)));
                }
                None => {
                    if self.config.verbose {
                        self.log(&format!("could not retry {}, it is locked", next.1))
                            .await;
                    }

                    self.next_url = None;
                    self.lock.clear();
                }
            }
        }

        loop {
            if !self.state.is_running() {
                return Ok(None);
            }

            let candidate = self
                .db
                .next_url_for(&self.ns, ModuleFlag::Crawled, self.state.last_url_id())
                .await?;

            let Some(candidate) = candidate else {
                return Ok(None);
            };

            match self
                .locks
                .lock_if_ok(candidate.0, "", self.config.lock_secs)
                .await?
            {
                Some(lease) => {
                    self.lock = lease;
                    self.next_url = Some(candidate.clone());

                    return Ok(Some((candidate, false)));
                }
                None => {
                    // locked by another worker: skip it and move on
                    if self.config.verbose {
                        self.log(&format!("skipped {}, because it is locked", candidate.1))
                            .await;
                    }

                    self.state.set_last_url_id(candidate.0);
                }
            }
        }
    }
}
