//! HTTP access to the origin site.

use async_trait::async_trait;
use std::time::Duration;
use url::Url;

use super::{Origin, OriginError, PageParser};
use crate::config::OriginConfig;
use crate::types::{BookMeta, ChapterRef};

/// [`Origin`] backed by `reqwest`, with page parsing delegated to `P`.
pub struct HttpOrigin<P> {
  client: reqwest::Client,
  /// Scheme and host every fetched url is rewritten to
  base: Url,
  parser: P,
}

impl<P: PageParser> HttpOrigin<P> {
  pub fn new(config: &OriginConfig, parser: P) -> Result<Self, OriginError> {
    Self::with_settings(
      &config.base_url,
      Duration::from_secs(config.timeout_secs),
      &config.user_agent,
      parser,
    )
  }

  pub fn with_settings(base_url: &str, timeout: Duration, user_agent: &str, parser: P) -> Result<Self, OriginError> {
    let mut base = Url::parse(base_url).map_err(|e| OriginError::InvalidUrl {
      url: base_url.to_string(),
      reason: e.to_string(),
    })?;
    if base.cannot_be_a_base() || base.host_str().is_none() {
      return Err(OriginError::InvalidUrl {
        url: base_url.to_string(),
        reason: "base url needs a host".to_string(),
      });
    }
    base.set_path("/");
    base.set_query(None);
    base.set_fragment(None);

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(user_agent)
      .build()?;

    Ok(Self { client, base, parser })
  }

  pub fn base_url(&self) -> &Url {
    &self.base
  }

  /// Home page of a book: `<base>/<book_id>/`.
  pub fn book_home(&self, book_id: &str) -> Result<Url, OriginError> {
    let invalid = |reason: &str| OriginError::InvalidUrl {
      url: book_id.to_string(),
      reason: reason.to_string(),
    };
    if book_id.is_empty() || book_id.contains(['/', '?', '#']) {
      return Err(invalid("book id must be a single path segment"));
    }
    self
      .base
      .join(&format!("{}/", book_id))
      .map_err(|e| invalid(&e.to_string()))
  }

  /// Resolve `raw` against the base and force the base's scheme and host onto it.
  pub fn canonicalize(&self, raw: &str) -> Result<Url, OriginError> {
    let invalid = |reason: String| OriginError::InvalidUrl {
      url: raw.to_string(),
      reason,
    };
    let mut url = self.base.join(raw).map_err(|e| invalid(e.to_string()))?;
    url
      .set_scheme(self.base.scheme())
      .map_err(|_| invalid("cannot rewrite scheme".to_string()))?;
    url
      .set_host(self.base.host_str())
      .map_err(|e| invalid(e.to_string()))?;
    url
      .set_port(self.base.port())
      .map_err(|_| invalid("cannot rewrite port".to_string()))?;
    Ok(url)
  }

  async fn fetch_html(&self, url: &Url) -> Result<String, OriginError> {
    tracing::debug!(url = %url, "Fetching origin page");
    let response = self
      .client
      .get(url.clone())
      .send()
      .await
      .map_err(|e| OriginError::from_reqwest(url.as_str(), e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(OriginError::Status {
        url: url.to_string(),
        status: status.as_u16(),
      });
    }

    response
      .text()
      .await
      .map_err(|e| OriginError::from_reqwest(url.as_str(), e))
  }
}

#[async_trait]
impl<P: PageParser> Origin for HttpOrigin<P> {
  async fn fetch_metadata(&self, book_id: &str) -> Result<BookMeta, OriginError> {
    let home = self.book_home(book_id)?;
    let html = self.fetch_html(&home).await?;
    let mut meta = self
      .parser
      .parse_book_info(&html, &self.base)
      .ok_or_else(|| OriginError::Parse {
        url: home.to_string(),
        reason: "no book info on page".to_string(),
      })?;

    if meta.source_url.as_deref().map_or(true, |s| s.trim().is_empty()) {
      meta.source_url = Some(home.to_string());
    }
    if let Some(pointer) = meta.last_chapter.as_mut() {
      if !pointer.url.is_empty() {
        if let Ok(url) = self.canonicalize(&pointer.url) {
          pointer.url = url.into();
        }
      }
    }
    Ok(meta)
  }

  async fn fetch_chapter_list(&self, book_id: &str) -> Result<Vec<ChapterRef>, OriginError> {
    let home = self.book_home(book_id)?;
    let html = self.fetch_html(&home).await?;
    let mut chapters = self.parser.parse_chapter_list(&html, &self.base);
    if chapters.is_empty() {
      return Err(OriginError::NotFound {
        what: format!("chapters of book {}", book_id),
      });
    }

    for chapter in chapters.iter_mut() {
      match self.canonicalize(&chapter.url) {
        Ok(url) => chapter.url = url.into(),
        Err(err) => tracing::debug!(book_id, chapter = chapter.number, error = %err, "Keeping chapter url as parsed"),
      }
    }
    tracing::debug!(book_id, count = chapters.len(), "Fetched chapter list");
    Ok(chapters)
  }

  async fn fetch_content(&self, chapter_url: &str) -> Result<String, OriginError> {
    let url = self.canonicalize(chapter_url)?;
    let html = self.fetch_html(&url).await?;
    self
      .parser
      .parse_chapter_text(&html)
      .ok_or_else(|| OriginError::Parse {
        url: url.to_string(),
        reason: "no chapter text on page".to_string(),
      })
  }
}
