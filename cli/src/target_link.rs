/// Target link detection for the interactively supplied input.
///
/// Picks the first usable link out of whatever the user pasted. YouTube links
/// are recognised by shape; any other http(s) URL is passed through as-is and
/// left for the media fetcher to judge.
use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetLink {
    YoutubeVideo { url: String, video_id: String },
    YoutubeShort { url: String, video_id: String },
    YoutubeMusic { url: String, video_id: String },
    YoutubePlaylist { url: String, playlist_id: String },
    /// Any other site.
    Other { url: String },
}

impl TargetLink {
    pub fn url(&self) -> &str {
        match self {
            TargetLink::YoutubeVideo { url, .. }
            | TargetLink::YoutubeShort { url, .. }
            | TargetLink::YoutubeMusic { url, .. }
            | TargetLink::YoutubePlaylist { url, .. }
            | TargetLink::Other { url } => url,
        }
    }

    /// Video or playlist id, for YouTube links.
    pub fn id(&self) -> Option<&str> {
        match self {
            TargetLink::YoutubeVideo { video_id, .. }
            | TargetLink::YoutubeShort { video_id, .. }
            | TargetLink::YoutubeMusic { video_id, .. } => Some(video_id.as_str()),
            TargetLink::YoutubePlaylist { playlist_id, .. } => Some(playlist_id.as_str()),
            TargetLink::Other { .. } => None,
        }
    }

    pub fn is_playlist(&self) -> bool {
        matches!(self, TargetLink::YoutubePlaylist { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TargetLink::YoutubeVideo { .. } => "YouTube video",
            TargetLink::YoutubeShort { .. } => "YouTube short",
            TargetLink::YoutubeMusic { .. } => "YouTube Music track",
            TargetLink::YoutubePlaylist { .. } => "YouTube playlist",
            TargetLink::Other { .. } => "link",
        }
    }
}

// ====== REGEX PATTERNS ======

/// An http(s) URL, or a bare YouTube host at a word boundary.
static LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?:https?://|\b(?:(?:www|m|music)\.)?(?:youtube\.com|youtu\.be)/)[^\s<>\[\](){},"']+"#,
    )
    .unwrap()
});

// Classification patterns run on the extracted link, anchored at its host.

static YOUTUBE_PLAYLIST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https?://(?:(?:www|m|music)\.)?youtube\.com/(?:playlist|watch)\?(?:[^#]*&)?list=([a-zA-Z0-9_-]+)")
        .unwrap()
});

static YOUTUBE_SHORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https?://(?:(?:www|m)\.)?youtube\.com/shorts/([a-zA-Z0-9_-]{11})").unwrap()
});

static YOUTUBE_MUSIC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https?://music\.youtube\.com/watch\?(?:[^#]*&)?v=([a-zA-Z0-9_-]{11})").unwrap()
});

static YOUTUBE_VIDEO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^https?://(?:(?:(?:www|m)\.)?youtube\.com/watch\?(?:[^#]*&)?v=|youtu\.be/)([a-zA-Z0-9_-]{11})",
    )
    .unwrap()
});

fn with_scheme(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

/// The first link in `text`, classified by shape. The link itself is kept
/// exactly as given apart from adding a missing scheme.
pub fn detect(text: &str) -> Option<TargetLink> {
    let url = with_scheme(LINK_RE.find(text)?.as_str());

    // Most specific first: music and shorts also live on youtube.com
    if let Some(cap) = YOUTUBE_PLAYLIST_RE.captures(&url) {
        let playlist_id = cap[1].to_string();
        return Some(TargetLink::YoutubePlaylist { url, playlist_id });
    }
    if let Some(cap) = YOUTUBE_SHORT_RE.captures(&url) {
        let video_id = cap[1].to_string();
        return Some(TargetLink::YoutubeShort { url, video_id });
    }
    if let Some(cap) = YOUTUBE_MUSIC_RE.captures(&url) {
        let video_id = cap[1].to_string();
        return Some(TargetLink::YoutubeMusic { url, video_id });
    }
    if let Some(cap) = YOUTUBE_VIDEO_RE.captures(&url) {
        let video_id = cap[1].to_string();
        return Some(TargetLink::YoutubeVideo { url, video_id });
    }

    Some(TargetLink::Other { url })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_youtube_video() {
        let link = detect("Check this out: https://www.youtube.com/watch?v=dQw4w9WgXcQ").unwrap();
        assert!(matches!(&link, TargetLink::YoutubeVideo { video_id, .. } if video_id == "dQw4w9WgXcQ"));
        assert_eq!(link.url(), "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
    }

    #[test]
    fn test_youtu_be_without_scheme() {
        let link = detect("youtu.be/dQw4w9WgXcQ").unwrap();
        assert_eq!(link.url(), "https://youtu.be/dQw4w9WgXcQ");
    }

    #[test]
    fn test_playlist() {
        let link = detect("https://www.youtube.com/playlist?list=PLrAXtmErZgOeiKm4sgNOknGvNjby9efdf").unwrap();
        assert!(link.is_playlist());
        assert_eq!(link.id(), Some("PLrAXtmErZgOeiKm4sgNOknGvNjby9efdf"));
        assert_eq!(link.kind(), "YouTube playlist");
    }

    #[test]
    fn test_short_and_music() {
        assert!(matches!(
            detect("https://www.youtube.com/shorts/abc123def45"),
            Some(TargetLink::YoutubeShort { .. })
        ));
        assert!(matches!(
            detect("https://music.youtube.com/watch?v=dQw4w9WgXcQ"),
            Some(TargetLink::YoutubeMusic { .. })
        ));
    }

    #[test]
    fn test_other_site_passes_through() {
        let link = detect("grab https://vimeo.com/76979871 please").unwrap();
        assert_eq!(
            link,
            TargetLink::Other {
                url: "https://vimeo.com/76979871".to_string()
            }
        );
    }

    #[test]
    fn test_query_parameters_are_kept() {
        let link = detect("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42").unwrap();
        assert_eq!(link.url(), "https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42");
        assert_eq!(link.id(), Some("dQw4w9WgXcQ"));

        let link = detect("https://youtu.be/dQw4w9WgXcQ?si=abc).").unwrap();
        assert_eq!(link.url(), "https://youtu.be/dQw4w9WgXcQ?si=abc");
    }

    #[test]
    fn test_watch_with_list_is_playlist() {
        let url = "https://www.youtube.com/watch?v=dQw4w9WgXcQ&list=PLrAXtmErZgOeiKm4sgNOknGvNjby9efdf";
        let link = detect(url).unwrap();
        assert!(link.is_playlist());
        assert_eq!(link.url(), url);
        assert_eq!(link.id(), Some("PLrAXtmErZgOeiKm4sgNOknGvNjby9efdf"));
    }

    #[test]
    fn test_lookalike_host_is_not_youtube() {
        let url = "https://notyoutube.com/watch?v=dQw4w9WgXcQ";
        let link = detect(url).unwrap();
        assert_eq!(link, TargetLink::Other { url: url.to_string() });

        let link = detect("see notyoutube.com/watch?v=dQw4w9WgXcQ");
        assert!(link.is_none());
    }

    #[test]
    fn test_no_link() {
        assert!(detect("just some words").is_none());
        assert!(detect("").is_none());
    }
}
