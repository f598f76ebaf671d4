use std::time::SystemTime;

use futures::{future::BoxFuture, Future, FutureExt};
use opentelemetry::{metrics::*, Context, KeyValue};

pub trait RecordDuration<'a>: 'a {
	type Output;

	fn record_duration(
		self,
		r: &'a Histogram<f64>,
		attributes: &'a [KeyValue],
	) -> BoxFuture<'a, Self::Output>;
	fn bound_record_duration(self, r: &'a Histogram<f64>) -> BoxFuture<'a, Self::Output>;
}

impl<'a, T, F> RecordDuration<'a> for F
where
	F: Future<Output = T> + Send + 'a,
{
	type Output = T;

	fn record_duration(
		self,
		r: &'a Histogram<f64>,
		attributes: &'a [KeyValue],
	) -> BoxFuture<'a, Self::Output> {
		async move {
			let request_start = SystemTime::now();
			let res = self.await;
			r.record(
				&Context::current(),
				request_start
					.elapsed()
					.map_or(0.0, |d| d.as_secs_f64()),
				attributes,
			);
			res
		}
		.boxed()
	}

	fn bound_record_duration(self, r: &'a Histogram<f64>) -> BoxFuture<'a, Self::Output> {
		self.record_duration(r, &[])
	}
}
