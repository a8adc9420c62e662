pub mod feed_store;
pub mod item_store;
pub mod subscription_store;

pub use feed_store::SqliteFeedStore;
pub use item_store::SqliteItemStore;
pub use subscription_store::SqliteSubscriptionStore;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
