mod client;
mod oauth;

pub use client::{
    ApiErrorClass, DriveClient, DriveError, DriveFile, FOLDER_MIME_TYPE, FileList, UploadSession,
    export_format_for,
};
pub use oauth::{GOOGLE_TOKEN_URI, OAuthClient, OAuthError, OAuthToken};
