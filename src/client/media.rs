use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{MediaError, SignalError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// A captured local stream: what gets attached to every peer link.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalMedia {
    pub stream_id: String,
    pub tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    pub fn has_video(&self) -> bool {
        self.video_track().is_some()
    }

    pub fn video_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == TrackKind::Video)
    }

    /// Same stream with its video replaced by `track`, or dropped for `None`.
    pub fn with_video(&self, track: Option<LocalTrack>) -> Self {
        let mut tracks: Vec<LocalTrack> = self
            .tracks
            .iter()
            .filter(|t| t.kind != TrackKind::Video)
            .cloned()
            .collect();
        tracks.extend(track);
        Self {
            stream_id: self.stream_id.clone(),
            tracks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub const AUDIO_VIDEO: Self = Self {
        audio: true,
        video: true,
    };
    pub const AUDIO_ONLY: Self = Self {
        audio: true,
        video: false,
    };
}

/// Camera, microphone and screen capture.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn acquire_local_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalMedia, MediaError>;

    async fn acquire_display_media(&self) -> Result<LocalMedia, MediaError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredMedia {
    pub media: LocalMedia,
    /// Camera failed and the call continues audio-only.
    pub degraded: bool,
}

/// Audio and video first, audio alone if the camera is unusable.
///
/// Only when audio-only capture fails too is the error surfaced; it is never
/// retried here, the user retries.
pub async fn acquire_with_fallback(
    provider: &dyn MediaProvider,
) -> Result<AcquiredMedia, SignalError> {
    match provider
        .acquire_local_media(MediaConstraints::AUDIO_VIDEO)
        .await
    {
        Ok(media) => Ok(AcquiredMedia {
            media,
            degraded: false,
        }),
        Err(video_err) => {
            tracing::warn!("video capture failed, falling back to audio only: {}", video_err);
            let media = provider
                .acquire_local_media(MediaConstraints::AUDIO_ONLY)
                .await
                .map_err(SignalError::MediaUnavailable)?;
            Ok(AcquiredMedia {
                media,
                degraded: true,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeProvider {
        video: Result<(), MediaError>,
        audio: Result<(), MediaError>,
        calls: Mutex<Vec<MediaConstraints>>,
    }

    impl FakeProvider {
        fn new(video: Result<(), MediaError>, audio: Result<(), MediaError>) -> Self {
            Self {
                video,
                audio,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MediaProvider for FakeProvider {
        async fn acquire_local_media(
            &self,
            constraints: MediaConstraints,
        ) -> Result<LocalMedia, MediaError> {
            self.calls.lock().unwrap().push(constraints);
            let outcome = if constraints.video { self.video } else { self.audio };
            outcome?;
            let mut tracks = vec![LocalTrack {
                id: "mic".into(),
                kind: TrackKind::Audio,
            }];
            if constraints.video {
                tracks.push(LocalTrack {
                    id: "cam".into(),
                    kind: TrackKind::Video,
                });
            }
            Ok(LocalMedia {
                stream_id: "local".into(),
                tracks,
            })
        }

        async fn acquire_display_media(&self) -> Result<LocalMedia, MediaError> {
            Err(MediaError::NotAllowed)
        }
    }

    #[tokio::test]
    async fn full_media_when_camera_works() {
        let provider = FakeProvider::new(Ok(()), Ok(()));
        let acquired = acquire_with_fallback(&provider).await.unwrap();

        assert!(!acquired.degraded);
        assert!(acquired.media.has_video());
        assert_eq!(provider.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn camera_in_use_degrades_to_audio() {
        let provider = FakeProvider::new(Err(MediaError::NotReadable), Ok(()));
        let acquired = acquire_with_fallback(&provider).await.unwrap();

        assert!(acquired.degraded);
        assert!(!acquired.media.has_video());
        assert_eq!(
            *provider.calls.lock().unwrap(),
            vec![MediaConstraints::AUDIO_VIDEO, MediaConstraints::AUDIO_ONLY]
        );
    }

    #[tokio::test]
    async fn total_failure_is_surfaced() {
        let provider = FakeProvider::new(Err(MediaError::NotAllowed), Err(MediaError::NotAllowed));
        let err = acquire_with_fallback(&provider).await.unwrap_err();

        assert_eq!(err, SignalError::MediaUnavailable(MediaError::NotAllowed));
        assert_eq!(provider.calls.lock().unwrap().len(), 2);
    }
}
