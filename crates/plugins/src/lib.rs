//! Plugin side of `slink`: URL matching, the plugin registry and resolver,
//! response validation, quality weights and the site plugins themselves.

pub mod arguments;
pub mod cache;
pub mod error;
pub mod keeper;
pub mod matcher;
pub mod platforms;
pub mod plugin;
pub mod registry;
pub mod request;
pub mod resolver;
pub mod stream;
pub mod validate;
pub mod weight;

pub use arguments::{ArgumentType, OptionValue, PluginArgument, PluginArguments, PluginOptions};
pub use cache::PluginCache;
pub use error::{KeeperError, PluginError, ResolveError};
pub use matcher::{MatchedUrl, Matcher, Priority};
pub use plugin::{Plugin, PluginContext, PluginSpec};
pub use registry::PluginRegistry;
pub use resolver::{ResolvedPlugin, Resolver};
pub use stream::{Stream, StreamSet};
