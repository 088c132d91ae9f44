//! AWS cloud provider implementation
//!
//! Implements the conversion tool's `CloudApi` seam over the AWS SDK. The
//! SDK absorbs throttling and transient failures (standard retry mode,
//! five attempts, mirroring the original tool's client configuration);
//! everything surfacing from here is data or a typed non-retryable error.

mod aws;
mod convert;

pub use aws::AwsCloud;
