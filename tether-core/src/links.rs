use url::Url;

/// Accept only http(s) URLs for handing to the system browser.
pub fn parse_openable_url(raw: &str) -> Result<Url, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("no url given".into());
    }

    let url = Url::parse(raw).map_err(|e| format!("{:?} is not a url: {}", raw, e))?;
    if matches!(url.scheme(), "http" | "https") {
        Ok(url)
    } else {
        Err(format!("refusing {} link, only http and https open", url.scheme()))
    }
}
