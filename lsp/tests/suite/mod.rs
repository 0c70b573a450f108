mod failures;
mod lifecycle;
mod routing;
