//! Persistence for videos, reference images, jobs and their results.
//!
//! Services only see the store traits in [`backend`]; [`SqliteDb`] is the
//! shipped implementation.

mod schema;
pub mod backend;
pub mod catalog;
pub mod jobs;
pub mod results;
pub mod search;
pub mod sqlite;

pub use backend::{CatalogStore, JobStore, ResultStore, SearchStore, Store};
pub use catalog::{NewReferenceImage, NewVideo, ReferenceImage, Video, VideoStatus};
pub use jobs::{ActiveJobInsert, AnalysisJob, JobKind, JobStatus, JobTermination, SearchJob};
pub use results::{
    person_label, AnalysisResult, BoundingBox, PeoplePerFrame, Person, PersonFace, TrackingData,
};
pub use schema::SCHEMA;
pub use search::{Match, SearchResult};
pub use sqlite::SqliteDb;
