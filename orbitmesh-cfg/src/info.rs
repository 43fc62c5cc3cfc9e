//  INFO.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Defines the general [`Info`]-trait, which is used to abstract over the
//!   disk-stored configuration files of OrbitMesh. Only a YAML backend is
//!   provided, since that is the only format the platform's config files
//!   use.
//

use std::error::Error;
use std::fmt::{Debug, Display, Formatter, Result as FResult};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs::File as TFile;
use tokio::io::AsyncReadExt as _;


/***** ERRORS *****/
/// Defines general errors for configs.
#[derive(Debug)]
pub enum InfoError<E: Debug> {
    /// Failed to create the output file.
    OutputCreate { path: PathBuf, err: std::io::Error },
    /// Failed to open the input file.
    InputOpen { path: PathBuf, err: std::io::Error },
    /// Failed to read the input file.
    InputRead { path: PathBuf, err: std::io::Error },

    /// Failed to serialize the config to a string or writer.
    Serialize { err: E },
    /// Failed to serialize the config to a given file.
    FileSerialize { path: PathBuf, err: E },

    /// Failed to deserialize a string or reader to the config.
    Deserialize { err: E },
    /// Failed to deserialize a file to the config.
    FileDeserialize { path: PathBuf, err: E },
}
impl<E: Error> Display for InfoError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use InfoError::*;
        match self {
            OutputCreate { path, .. } => write!(f, "Failed to create output file '{}'", path.display()),
            InputOpen { path, .. } => write!(f, "Failed to open input file '{}'", path.display()),
            InputRead { path, .. } => write!(f, "Failed to read input file '{}'", path.display()),

            Serialize { .. } => write!(f, "Failed to serialize config"),
            FileSerialize { path, .. } => write!(f, "Failed to serialize config to output file '{}'", path.display()),

            Deserialize { .. } => write!(f, "Failed to deserialize config"),
            FileDeserialize { path, .. } => write!(f, "Failed to deserialize config from input file '{}'", path.display()),
        }
    }
}
impl<E: 'static + Error> Error for InfoError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        use InfoError::*;
        match self {
            OutputCreate { err, .. } => Some(err),
            InputOpen { err, .. } => Some(err),
            InputRead { err, .. } => Some(err),

            Serialize { err } => Some(err),
            FileSerialize { err, .. } => Some(err),

            Deserialize { err } => Some(err),
            FileDeserialize { err, .. } => Some(err),
        }
    }
}

/// A type alias for the InfoError over the YAML backend.
pub type YamlError = InfoError<serde_yaml::Error>;





/***** LIBRARY *****/
/// Defines a serializable struct that we typically use for structs that are directly read and written to disk.
#[async_trait]
pub trait Info: Clone + Debug {
    /// The types of errors that may be thrown by the serialization function(s).
    type Error: Error;


    // Child-provided
    /// Serializes this config to a string.
    ///
    /// # Errors
    /// This function may error if the serialization failed.
    fn to_string(&self) -> Result<String, InfoError<Self::Error>>;
    /// Serializes this config to a writer.
    ///
    /// # Arguments
    /// - `writer`: The `Write`r to write the serialized representation to.
    ///
    /// # Errors
    /// This function may error if the serialization failed or if we failed to write to the given writer.
    fn to_writer(&self, writer: impl Write) -> Result<(), InfoError<Self::Error>>;

    /// Deserializes the given string to an instance of ourselves.
    ///
    /// # Arguments
    /// - `raw`: The raw string to deserialize.
    ///
    /// # Errors
    /// This function may fail if the input string was invalid for this object.
    fn from_string(raw: impl AsRef<str>) -> Result<Self, InfoError<Self::Error>>;
    /// Deserializes the contents of the given reader to an instance of ourselves.
    ///
    /// # Arguments
    /// - `reader`: The `Read`er whose contents to deserialize.
    ///
    /// # Errors
    /// This function may fail if we failed to read from the reader or if its contents were invalid for this object.
    fn from_reader(reader: impl Read) -> Result<Self, InfoError<Self::Error>>;


    // Globally deduced
    /// Serializes this config to a file at the given path.
    ///
    /// # Arguments
    /// - `path`: The path where to write the file to.
    ///
    /// # Errors
    /// This function may error if the serialization failed or if we failed to create and/or write to the file.
    fn to_path(&self, path: impl AsRef<Path>) -> Result<(), InfoError<Self::Error>> {
        let path: &Path = path.as_ref();

        // Attempt to create the new file
        let handle: File = match File::create(path) {
            Ok(handle) => handle,
            Err(err) => {
                return Err(InfoError::OutputCreate { path: path.into(), err });
            },
        };

        // Write it using the child function, wrapping the error that may occur
        match self.to_writer(handle) {
            Ok(_) => Ok(()),
            Err(InfoError::Serialize { err }) => Err(InfoError::FileSerialize { path: path.into(), err }),
            Err(err) => Err(err),
        }
    }

    /// Deserializes this config from the file at the given path.
    ///
    /// # Arguments
    /// - `path`: The path where to read the file from.
    ///
    /// # Errors
    /// This function may fail if we failed to open/read from the file or if its contents were invalid for this object.
    fn from_path(path: impl AsRef<Path>) -> Result<Self, InfoError<Self::Error>> {
        let path: &Path = path.as_ref();

        // Attempt to open the given file
        let handle: File = match File::open(path) {
            Ok(handle) => handle,
            Err(err) => {
                return Err(InfoError::InputOpen { path: path.into(), err });
            },
        };

        // Read it using the child function, wrapping the error that may occur
        match Self::from_reader(handle) {
            Ok(config) => Ok(config),
            Err(InfoError::Deserialize { err }) => Err(InfoError::FileDeserialize { path: path.into(), err }),
            Err(err) => Err(err),
        }
    }

    /// Deserializes this config from the file at the given path, with the reading part done asynchronously.
    ///
    /// Note that the parsing itself cannot be done asynchronously, since serde does not support
    /// asynchronous deserialization; we read the entire file in one go.
    ///
    /// # Arguments
    /// - `path`: The path where to read the file from.
    ///
    /// # Errors
    /// This function may fail if we failed to open/read from the file or if its contents were invalid for this object.
    async fn from_path_async(path: impl Send + AsRef<Path>) -> Result<Self, InfoError<Self::Error>> {
        let path: &Path = path.as_ref();

        // Read the file to a string
        let raw: String = {
            // Attempt to open the given file
            let mut handle: TFile = match TFile::open(path).await {
                Ok(handle) => handle,
                Err(err) => {
                    return Err(InfoError::InputOpen { path: path.into(), err });
                },
            };

            // Read everything to a string
            let mut raw: String = String::new();
            if let Err(err) = handle.read_to_string(&mut raw).await {
                return Err(InfoError::InputRead { path: path.into(), err });
            }
            raw
        };

        // Parse it using the child function, wrapping the error that may occur
        match Self::from_string(raw) {
            Ok(config) => Ok(config),
            Err(InfoError::Deserialize { err }) => Err(InfoError::FileDeserialize { path: path.into(), err }),
            Err(err) => Err(err),
        }
    }
}



/// A marker trait that will let the compiler implement [`Info`] for this object using the `serde_yaml` backend.
pub trait YamlInfo<'de>: Clone + Debug + Deserialize<'de> + Serialize {}
impl<T: DeserializeOwned + Serialize + for<'de> YamlInfo<'de>> Info for T {
    type Error = serde_yaml::Error;

    fn to_string(&self) -> Result<String, InfoError<Self::Error>> {
        match serde_yaml::to_string(self) {
            Ok(raw) => Ok(raw),
            Err(err) => Err(InfoError::Serialize { err }),
        }
    }

    fn to_writer(&self, writer: impl Write) -> Result<(), InfoError<Self::Error>> {
        match serde_yaml::to_writer(writer, self) {
            Ok(_) => Ok(()),
            Err(err) => Err(InfoError::Serialize { err }),
        }
    }

    fn from_string(raw: impl AsRef<str>) -> Result<Self, InfoError<Self::Error>> {
        match serde_yaml::from_str(raw.as_ref()) {
            Ok(config) => Ok(config),
            Err(err) => Err(InfoError::Deserialize { err }),
        }
    }

    fn from_reader(reader: impl Read) -> Result<Self, InfoError<Self::Error>> {
        match serde_yaml::from_reader(reader) {
            Ok(config) => Ok(config),
            Err(err) => Err(InfoError::Deserialize { err }),
        }
    }
}
