mod google_ads;
mod traits;

pub use google_ads::GoogleAdsProvider;
pub use traits::{OAuthProvider, TokenSet};
