pub mod db;
pub mod provenance;
pub mod repository;
pub mod types;
pub mod vector_index;
