pub mod agglomerative;
pub mod centroid;
pub mod dbscan;
pub mod recluster;
