use crate::flag::FeatureFlag;
use crate::property::Property;
use crate::segment::Segment;

/// Store is an interface for looking up the parts of a specification that an evaluation needs.
///
/// Ordinarily the only implementation is [crate::Specification] itself, which indexes its flags,
/// segments and properties when it is built.
pub trait Store {
    /// Retrieve the flag with id `flag_id`.
    fn flag(&self, flag_id: &str) -> Option<&FeatureFlag>;

    /// Retrieve the flag whose unique name is `flag_name`.
    fn flag_by_name(&self, flag_name: &str) -> Option<&FeatureFlag>;

    /// Retrieve the segment with id `segment_id`.
    fn segment(&self, segment_id: &str) -> Option<&Segment>;

    /// Retrieve the property with id `property_id`.
    fn property(&self, property_id: &str) -> Option<&Property>;

    /// All declared properties, in declaration order.
    fn properties(&self) -> &[Property];
}
