use thiserror::Error;

/// Per-task pipeline failures. The `Display` strings are the exact
/// user-facing messages surfaced next to a photo card, so they are kept
/// verbatim from the product copy.
#[derive(Debug, Error)]
pub enum StampError {
    /// The binary contains no parseable EXIF tag directory at all.
    #[error("EXIFデータが見つかりません。")]
    MetadataMissing,
    /// Tags are present but carry no GPS coordinate.
    #[error("写真にGPSデータが見つかりません。")]
    CoordinateMissing,
    /// The geocode/places lookup produced nothing usable, or the provider
    /// call failed. Carries the provider-supplied message verbatim.
    #[error("場所の取得に失敗: {0}")]
    ResolutionFailed(String),
    /// The source bytes cannot be decoded as a raster image.
    #[error("画像ファイルの読み込みに失敗しました。")]
    ImageDecodeFailed,
    /// The drawing surface (font or pixel buffer) could not be acquired.
    #[error("Could not get canvas context")]
    CanvasUnavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_failed_carries_provider_message() {
        let err = StampError::ResolutionFailed("サーバーからの応答エラー: 500".into());
        assert_eq!(err.to_string(), "場所の取得に失敗: サーバーからの応答エラー: 500");
    }
}
